use crate::store::CheckpointMetadata;
use std::io::{self, Write};

pub fn print_help() {
    println!("rewind {}", env!("CARGO_PKG_VERSION"));
    println!("Checkpoints + jump for AI coding agent sessions — code and chat together.\n");
    print_usage();
    print_options();
}

fn print_usage() {
    println!("USAGE:");
    println!("  rewind save [message...]        Create a checkpoint");
    println!("  rewind list                     List recent checkpoints (newest first)");
    println!("  rewind jump [SELECTOR]          Restore code + fork chat");
    println!("  rewind back [N] [OPTIONS]       Rewind by the last N user prompts");
    println!("  rewind undo                     Restore previous checkpoint, drop newest");
    println!("  rewind rewrite-chat [SELECTOR]  DESTRUCTIVE: rewrite chat in-place");
    println!("  rewind gc [--keep N]            Delete old checkpoints (default keep: 50)");
    println!("  rewind init [--mode MODE]       Initialize storage (project | global)");
    println!("  rewind status                   Show storage mode, counts, agent");
    println!("  rewind doctor                   Check configuration and storage health");
    println!("  rewind setup [OPTIONS]          Install hooks into agent settings");
    println!("  rewind help | --help | -h       Show this message");
    println!("  rewind --version | -V           Show version\n");
    println!("INTERNAL:");
    println!("  rewind hook                     Process a hook event from stdin (used by agents)\n");
}

fn print_options() {
    println!("SELECTOR:");
    println!("  last (default) | prev | N (1-based, newest first) | <checkpoint-name>\n");
    println!("BACK OPTIONS:");
    println!("  --both            Also restore code to the nearest checkpoint at-or-before");
    println!("                    the chat boundary");
    println!("  --in-place        Rewrite the current transcript in-place (with backup)");
    println!("  --copy            Copy reverted prompt(s) to the clipboard (best-effort)\n");
    println!("SETUP OPTIONS:");
    println!("  --tier <name>     Hook tier: minimal | balanced (default) | aggressive");
    println!("  --remove          Remove rewind hooks without installing new ones\n");
    println!("GLOBAL OPTIONS:");
    println!("  --debug           Enable debug output (also: REWIND_DEBUG=1)");
    println!("  --no-color        Disable colored output (also respects NO_COLOR env)\n");
    println!("ENVIRONMENT:");
    println!("  REWIND_PROJECT_ROOT      Override the project root (default: cwd)");
    println!("  REWIND_TRANSCRIPT_PATH   Override the transcript used by 'rewind back'");
}

/// `last | prev | N | <name>` against a newest-first checkpoint list.
pub fn resolve_selector<'a>(
    selector: &str,
    checkpoints: &'a [CheckpointMetadata],
) -> Option<&'a CheckpointMetadata> {
    let s = selector.trim();
    if checkpoints.is_empty() {
        return None;
    }
    if s.is_empty() || s == "last" {
        return checkpoints.first();
    }
    if s == "prev" {
        return checkpoints.get(1);
    }
    if s.chars().all(|c| c.is_ascii_digit()) {
        let n: usize = s.parse().ok()?;
        if n >= 1 {
            return checkpoints.get(n - 1);
        }
        return None;
    }
    checkpoints.iter().find(|cp| cp.name == s)
}

pub fn get_flag(args: &[String], flag: &str) -> Option<String> {
    args.windows(2).find(|w| w[0] == flag).map(|w| w[1].clone())
}

pub fn has_flag(args: &[String], flag: &str) -> bool {
    args.iter().any(|a| a == flag)
}

pub fn prompt(question: &str, default: &str) -> io::Result<String> {
    print!("{question}");
    io::stdout().flush()?;
    let mut input = String::new();
    io::stdin().read_line(&mut input)?;
    let trimmed = input.trim();
    Ok(if trimmed.is_empty() {
        default.to_string()
    } else {
        trimmed.to_string()
    })
}

/// Pipe text into the first clipboard tool that works.
pub fn try_copy_to_clipboard(text: &str) -> bool {
    if text.is_empty() {
        return false;
    }

    let candidates: &[&[&str]] = &[
        &["pbcopy"],
        &["wl-copy"],
        &["xclip", "-selection", "clipboard"],
        &["xsel", "--clipboard", "--input"],
        &["clip.exe"],
    ];

    for cmd in candidates {
        let spawned = std::process::Command::new(cmd[0])
            .args(&cmd[1..])
            .stdin(std::process::Stdio::piped())
            .stdout(std::process::Stdio::null())
            .stderr(std::process::Stdio::null())
            .spawn();
        let Ok(mut child) = spawned else { continue };
        let wrote = child
            .stdin
            .take()
            .map(|mut stdin| stdin.write_all(text.as_bytes()).is_ok())
            .unwrap_or(false);
        if wrote && child.wait().map(|s| s.success()).unwrap_or(false) {
            return true;
        }
    }
    false
}
