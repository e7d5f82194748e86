mod agents;
mod cli;
mod config;
mod controller;
mod doctor;
mod fmt;
mod fsutil;
mod hook;
mod paths;
mod policy;
mod setup;
mod store;
mod transcript;

use anyhow::{bail, Result};
use cli::{get_flag, has_flag};
use controller::{RestoreMode, RestoreOutcome, RewindController, TranscriptRestoreMode};
use fmt::{cprintln, DIM, GREEN, RESET, YELLOW};
use std::path::PathBuf;

const DEFAULT_LIST_LIMIT: usize = 20;
const DEFAULT_GC_KEEP: usize = 50;

fn main() -> Result<()> {
    let raw_args: Vec<String> = std::env::args().skip(1).collect();

    if raw_args.iter().any(|a| a == "--no-color") {
        fmt::disable_color();
    }
    if raw_args.iter().any(|a| a == "--debug") {
        std::env::set_var("REWIND_DEBUG", "1");
    }

    let args: Vec<String> = raw_args
        .into_iter()
        .filter(|a| a != "--no-color" && a != "--debug")
        .collect();

    if args.iter().any(|a| a == "--help" || a == "-h")
        || args.first().map(String::as_str) == Some("help")
    {
        cli::print_help();
        return Ok(());
    }

    if args.iter().any(|a| a == "--version" || a == "-V") {
        println!("rewind {}", env!("CARGO_PKG_VERSION"));
        return Ok(());
    }

    if let Some(result) = dispatch_subcommand(&args) {
        return result;
    }

    if let Some(unknown) = args.first() {
        eprintln!("rewind: unknown command '{unknown}'\n");
        eprintln!("Run 'rewind help' for usage.");
        std::process::exit(1);
    }

    cli::print_help();
    Ok(())
}

fn dispatch_subcommand(args: &[String]) -> Option<Result<()>> {
    match args.first().map(String::as_str) {
        Some("save") => Some(cmd_save(&args[1..])),
        Some("list") => Some(cmd_list()),
        Some("jump") => Some(cmd_jump(&args[1..])),
        Some("back") => Some(cmd_back(&args[1..])),
        Some("undo") => Some(cmd_undo()),
        Some("rewrite-chat") => Some(cmd_rewrite_chat(&args[1..])),
        Some("gc") => Some(cmd_gc(&args[1..])),
        Some("init") => Some(cmd_init(&args[1..])),
        Some("status") => Some(cmd_status()),
        Some("doctor") => {
            doctor::run(project_root());
            Some(Ok(()))
        }
        Some("setup") => Some(cmd_setup(&args[1..])),
        Some("hook") => Some(run_hook()),
        _ => None,
    }
}

/// Hooks must never block the agent: report and exit 1 (non-blocking error).
fn run_hook() -> Result<()> {
    if let Err(e) = hook::run() {
        eprintln!("[rewind] Hook error: {e}");
        std::process::exit(1);
    }
    Ok(())
}

fn project_root() -> PathBuf {
    std::env::var("REWIND_PROJECT_ROOT")
        .ok()
        .map(|s| s.trim().to_string())
        .filter(|s| !s.is_empty())
        .map(|s| paths::expand_user(&s))
        .unwrap_or_else(|| std::env::current_dir().unwrap_or_else(|_| PathBuf::from(".")))
}

fn controller() -> RewindController {
    RewindController::new(project_root())
}

fn cmd_save(args: &[String]) -> Result<()> {
    let description = if args.is_empty() {
        "Manual checkpoint".to_string()
    } else {
        args.join(" ").trim().to_string()
    };

    let outcome = controller().create_checkpoint(&description, None, None)?;
    let chat = if outcome.has_transcript { "yes" } else { "no" };
    println!(
        "Saved: {}  (code: {} files, chat: {chat})",
        outcome.name, outcome.file_count
    );
    Ok(())
}

fn cmd_list() -> Result<()> {
    let checkpoints = controller().list_checkpoints();
    if checkpoints.is_empty() {
        println!("No checkpoints found.");
        println!("Run 'rewind save' to create one.");
        return Ok(());
    }

    cprintln!("{DIM}#   Chat  Name                 Files  Description{RESET}");
    for (idx, cp) in checkpoints.iter().take(DEFAULT_LIST_LIMIT).enumerate() {
        let chat = if cp.has_transcript { "💬" } else { "  " };
        cprintln!(
            "{:<3} {chat}    {:<20} {:<6} {}",
            idx + 1,
            cp.name,
            cp.file_count,
            cp.description.trim()
        );
    }

    if checkpoints.len() > DEFAULT_LIST_LIMIT {
        cprintln!(
            "{DIM}Showing {DEFAULT_LIST_LIMIT} of {}. Use 'rewind gc' to trim old ones.{RESET}",
            checkpoints.len()
        );
    }
    Ok(())
}

fn cmd_jump(args: &[String]) -> Result<()> {
    let ctl = controller();
    let checkpoints = ctl.list_checkpoints();
    if checkpoints.is_empty() {
        bail!("No checkpoints found");
    }

    let selector = args.first().map(String::as_str).unwrap_or("last");
    let Some(chosen) = cli::resolve_selector(selector, &checkpoints) else {
        bail!("Invalid selector or checkpoint not found: {selector}");
    };

    let outcome = ctl.restore(
        &chosen.name,
        RestoreMode::All,
        false,
        TranscriptRestoreMode::Fork,
    )?;
    print_restore_result(&outcome);
    Ok(())
}

fn cmd_back(args: &[String]) -> Result<()> {
    let n: usize = match args.first().filter(|a| !a.starts_with("--")) {
        Some(raw) => match raw.parse() {
            Ok(n) if n >= 1 => n,
            _ => bail!("n must be >= 1"),
        },
        None => 1,
    };
    let both = has_flag(args, "--both");
    let in_place = has_flag(args, "--in-place");
    let copy = has_flag(args, "--copy");

    let outcome = controller().rewind_back(n, both, in_place)?;

    if let Some(checkpoint) = &outcome.code_checkpoint {
        eprintln!("Code restored to: {checkpoint}");
    }
    if let Some(note) = &outcome.note {
        eprintln!("{note}");
    }

    let prompts_text = outcome
        .prompts
        .iter()
        .map(|p| p.trim())
        .filter(|p| !p.is_empty())
        .collect::<Vec<_>>()
        .join("\n\n");
    if !prompts_text.is_empty() {
        if copy && cli::try_copy_to_clipboard(&prompts_text) {
            eprintln!("Copied reverted prompt(s) to clipboard.");
        } else {
            eprintln!("Reverted prompts (n={n}):");
            eprintln!("---");
            eprintln!("{prompts_text}");
            eprintln!("---");
        }
    }

    if outcome.fork_created {
        println!(
            "Fork created: {}",
            outcome.fork_session_id.as_deref().unwrap_or("?")
        );
        return Ok(());
    }

    println!("Chat rewritten in-place");
    if let Some(backup) = &outcome.backup_path {
        eprintln!("Backup: {backup}");
    }
    Ok(())
}

fn cmd_undo() -> Result<()> {
    let outcome = controller().undo()?;
    print_restore_result(&outcome.restore);
    println!("Deleted checkpoint: {}", outcome.deleted_checkpoint);
    Ok(())
}

fn cmd_rewrite_chat(args: &[String]) -> Result<()> {
    let ctl = controller();
    let checkpoints = ctl.list_checkpoints();
    if checkpoints.is_empty() {
        bail!("No checkpoints found");
    }

    let selector = args.first().map(String::as_str).unwrap_or("last");
    let Some(chosen) = cli::resolve_selector(selector, &checkpoints) else {
        bail!("Invalid selector or checkpoint not found: {selector}");
    };
    let name = chosen.name.clone();

    cprintln!("{YELLOW}This will rewrite your current agent transcript in-place.{RESET}");
    println!("A backup will be written under the rewind transcript-backup directory.\n");
    let typed = cli::prompt("Type REWRITE to continue: ", "")?;
    if typed != "REWRITE" {
        println!("Canceled.");
        return Ok(());
    }

    let outcome = ctl.restore(&name, RestoreMode::Context, true, TranscriptRestoreMode::InPlace)?;
    print_restore_result(&outcome);
    Ok(())
}

fn cmd_gc(args: &[String]) -> Result<()> {
    let keep: usize = match get_flag(args, "--keep") {
        Some(raw) => match raw.parse() {
            Ok(n) if n >= 1 => n,
            _ => bail!("--keep must be >= 1"),
        },
        None => DEFAULT_GC_KEEP,
    };

    let ctl = controller();
    let checkpoints = ctl.list_checkpoints();
    if checkpoints.len() <= keep {
        println!(
            "Nothing to clean up ({} checkpoints, keeping {keep}).",
            checkpoints.len()
        );
        return Ok(());
    }

    let to_delete = &checkpoints[keep..];
    println!("Will delete {} checkpoints (keeping {keep}).", to_delete.len());
    for cp in to_delete.iter().take(10) {
        let desc = if cp.description.is_empty() {
            "(no description)"
        } else {
            &cp.description
        };
        println!("  - {}: {desc}", cp.name);
    }
    if to_delete.len() > 10 {
        println!("  ... and {} more", to_delete.len() - 10);
    }

    let confirm = cli::prompt("Proceed? [y/N] ", "n")?;
    if confirm.to_lowercase() != "y" {
        println!("Canceled.");
        return Ok(());
    }

    let deleted = ctl.prune(keep)?;
    println!("Deleted {deleted} checkpoints.");
    Ok(())
}

fn cmd_init(args: &[String]) -> Result<()> {
    let mode = match get_flag(args, "--mode") {
        Some(raw) => match config::StorageMode::parse(&raw) {
            Some(mode) => Some(mode),
            None => bail!("--mode must be 'project' or 'global'"),
        },
        None => None,
    };

    let mut ctl = controller();
    let (rewind_dir, storage_mode) = ctl.init(mode)?;
    println!("Initialized rewind ({storage_mode} storage)");
    println!("  {}", paths::shorten_home(&rewind_dir.to_string_lossy()));
    Ok(())
}

fn cmd_status() -> Result<()> {
    let status = controller().get_status();

    cprintln!("{DIM}── rewind status ───────────────────────────────{RESET}");
    println!("  project:     {}", paths::shorten_home(&status.project_root));
    println!("  storage:     {} ({})", status.storage_mode, paths::shorten_home(&status.rewind_dir));
    println!("  initialized: {}", if status.initialized { "yes" } else { "no" });
    println!("  tier:        {}", status.tier);
    println!("  agent:       {}", status.agent);
    println!("  checkpoints: {}", status.checkpoint_count);
    if let Some(latest) = &status.latest_checkpoint {
        println!("  latest:      {latest}");
    }
    Ok(())
}

fn cmd_setup(args: &[String]) -> Result<()> {
    let tier = get_flag(args, "--tier").unwrap_or_else(|| config::DEFAULT_TIER.to_string());
    setup::run(&tier, has_flag(args, "--remove"))
}

fn print_restore_result(outcome: &RestoreOutcome) {
    if outcome.code_restored {
        cprintln!("{GREEN}Code restored to:{RESET} {}", outcome.name);
    }

    if outcome.context_restored {
        if outcome.fork_created {
            if let Some(fork) = &outcome.fork_path {
                println!("Chat fork: {fork}");
                println!("Next: select the forked session in your agent session list");
            }
        } else {
            println!("Chat rewritten in-place");
        }
    } else if outcome.context_requested {
        println!("Chat rewind unavailable for this checkpoint/session");
    }

    if let Some(err) = &outcome.context_error {
        eprintln!("Chat error: {err}");
    }
}
