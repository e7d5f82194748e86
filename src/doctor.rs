use crate::agents::AgentRegistry;
use crate::controller::RewindController;
use crate::fmt::{cprintln, BOLD, CYAN, DIM, GREEN, RED, RESET};
use crate::fsutil::safe_json_load;
use crate::paths;
use std::path::{Path, PathBuf};

pub fn run(project_root: PathBuf) {
    cprintln!();
    cprintln!("{DIM}── rewind doctor ───────────────────────────────{RESET}");
    cprintln!();

    let mut pass = 0;
    let mut fail = 0;

    let controller = RewindController::new(project_root);

    check_storage(&controller, &mut pass, &mut fail);
    check_session_info(&controller, &mut pass);
    check_agent_hooks(&mut pass, &mut fail);
    check_disk_space(&controller.checkpoints_dir());

    cprintln!();
    cprintln!(
        "  {BOLD}{pass}{RESET} passed  {}{fail}{} failed",
        if fail > 0 { RED } else { DIM },
        RESET
    );
    cprintln!();
}

fn check_storage(controller: &RewindController, pass: &mut u32, fail: &mut u32) {
    let status = controller.get_status();

    if status.initialized {
        ok(
            &format!(
                "rewind initialized ({} storage, {})",
                status.storage_mode,
                paths::shorten_home(&status.rewind_dir)
            ),
            pass,
        );
    } else {
        cprintln!("  {DIM}-{RESET}  not initialized yet (first checkpoint will create it)");
    }

    if status.checkpoint_count > 0 {
        let latest = status.latest_checkpoint.as_deref().unwrap_or("?");
        cprintln!(
            "  {CYAN}i{RESET}  {} checkpoint(s), latest {latest}",
            status.checkpoint_count
        );
    } else if status.initialized {
        cprintln!("  {CYAN}i{RESET}  no checkpoints yet — are the hooks installed?");
    }

    let validation = controller.validate_system();
    if status.initialized {
        if validation.valid {
            ok("storage layout is consistent", pass);
        } else {
            for issue in &validation.issues {
                err(issue, fail);
            }
        }
    }
}

fn check_session_info(controller: &RewindController, pass: &mut u32) {
    match controller.load_session_info() {
        Some(info) if !info.transcript_path.is_empty() => {
            let exists = paths::expand_user(&info.transcript_path).exists();
            if exists {
                ok(
                    &format!(
                        "session.json points at a live transcript (agent: {})",
                        info.agent
                    ),
                    pass,
                );
            } else {
                cprintln!(
                    "  {CYAN}i{RESET}  session.json transcript is gone ({})",
                    paths::shorten_home(&info.transcript_path)
                );
            }
        }
        Some(_) => {
            cprintln!("  {CYAN}i{RESET}  session.json has no transcript path yet");
        }
        None => {
            cprintln!("  {DIM}-{RESET}  no session.json (hooks have not fired in this project)");
        }
    }
}

fn check_agent_hooks(pass: &mut u32, fail: &mut u32) {
    let registry = AgentRegistry::bundled();
    for profile in registry.all() {
        let Some(settings_rel) = profile.settings_path() else {
            continue;
        };
        let settings_path = paths::home_dir().join(settings_rel);
        let agent_dir_exists = settings_path
            .parent()
            .map(|dir| dir.exists())
            .unwrap_or(false);

        if !agent_dir_exists {
            cprintln!(
                "  {DIM}-{RESET}  {} not detected (~/{settings_rel})",
                profile.display_name
            );
            continue;
        }

        match safe_json_load(&settings_path) {
            Some(settings) if crate::setup::rewind_hook_installed(&settings["hooks"]) => {
                ok(&format!("{} hooks installed", profile.display_name), pass);
            }
            Some(_) => err(
                &format!(
                    "{} detected but rewind hooks missing — run 'rewind setup'",
                    profile.display_name
                ),
                fail,
            ),
            None => cprintln!(
                "  {DIM}-{RESET}  {} detected, no settings file yet — run 'rewind setup'",
                profile.display_name
            ),
        }
    }
}

fn check_disk_space(storage_dir: &Path) {
    let dir = if storage_dir.exists() {
        storage_dir
    } else {
        match storage_dir.ancestors().find(|p| p.exists()) {
            Some(p) => p,
            None => return,
        }
    };

    let dir_cstr = match std::ffi::CString::new(dir.to_string_lossy().as_bytes().to_vec()) {
        Ok(c) => c,
        Err(_) => return,
    };

    let mut stat: libc::statvfs = unsafe { std::mem::zeroed() };
    let ret = unsafe { libc::statvfs(dir_cstr.as_ptr(), &mut stat) };
    if ret == 0 {
        #[allow(clippy::unnecessary_cast)]
        let avail = stat.f_bavail as u64 * stat.f_frsize as u64;
        if avail < 100 * 1024 * 1024 {
            cprintln!(
                "  {RED}!{RESET}  low disk space: {} available on storage filesystem",
                format_size(avail)
            );
        }
    }
}

fn format_size(size: u64) -> String {
    if size >= 1_048_576 {
        format!("{:.1}MB", size as f64 / 1_048_576.0)
    } else if size >= 1024 {
        format!("{}KB", size / 1024)
    } else {
        format!("{size}B")
    }
}

fn ok(msg: &str, pass: &mut u32) {
    cprintln!("  {GREEN}✓{RESET}  {msg}");
    *pass += 1;
}

fn err(msg: &str, fail: &mut u32) {
    cprintln!("  {RED}✗{RESET}  {msg}");
    *fail += 1;
}
