use std::io::{self, BufRead, IsTerminal, Write};
use std::sync::atomic::Ordering;

use crate::grammar;
use crate::router::{Context, Router};

const HELP: &str = "Enter /role::command(args). `list` shows commands, `quit` exits.";

/// Interactive loop over stdin.
pub fn run_repl(ctx: &Context) -> anyhow::Result<()> {
    let stdin = io::stdin();
    let interactive = stdin.is_terminal();
    if interactive {
        println!("{HELP}");
    }
    let failures = run_session(stdin.lock(), &mut io::stdout(), ctx, interactive)?;
    if failures > 0 {
        tracing::debug!(failures, "session had failed commands");
    }
    Ok(())
}

/// Read commands line by line, route each, and write the results.
/// Returns how many commands failed.
pub fn run_session(
    input: impl BufRead,
    out: &mut impl Write,
    ctx: &Context,
    prompt: bool,
) -> anyhow::Result<usize> {
    let router = Router::with_default_handlers();
    let mut failures = 0;
    if prompt {
        write!(out, "convoy> ")?;
        out.flush()?;
    }
    for line in input.lines() {
        if ctx.cancel.load(Ordering::SeqCst) {
            break;
        }
        let line = line?;
        let line = line.trim();
        match line {
            "" => {}
            "quit" | "exit" => break,
            "help" => writeln!(out, "{HELP}")?,
            "list" => {
                for (class, names) in router.list_commands(None) {
                    writeln!(out, "{class}: {}", names.join(", "))?;
                }
            }
            _ if line.starts_with('#') => {}
            _ => match grammar::parse(line) {
                Some(cmd) => {
                    let result = router.route(&cmd, ctx);
                    if !result.success {
                        failures += 1;
                    }
                    writeln!(out, "{result}")?;
                }
                None => {
                    failures += 1;
                    writeln!(out, "[ERR] Not a command: {line}")?;
                }
            },
        }
        if prompt {
            write!(out, "convoy> ")?;
            out.flush()?;
        }
    }
    Ok(failures)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::Config;

    #[test]
    fn session_routes_lines_and_stops_at_quit() {
        let dir = tempfile::tempdir().unwrap();
        let ctx = Context::new(dir.path().to_path_buf(), Config::default());
        let input = "# comment\n\n/qa::report_token_usage\nnonsense\n/qa::start_task\nquit\n/qa::start_next\n";
        let mut out = Vec::new();
        let failures = run_session(input.as_bytes(), &mut out, &ctx, false).unwrap();
        let text = String::from_utf8(out).unwrap();
        let lines: Vec<&str> = text.lines().collect();
        assert_eq!(lines.len(), 3, "{text}");
        assert_eq!(lines[0], "[OK] Token usage report for qa");
        assert_eq!(lines[1], "[ERR] Not a command: nonsense");
        assert!(lines[2].starts_with("[ERR] Invalid command:"));
        assert_eq!(failures, 2);
    }

    #[test]
    fn session_lists_commands() {
        let dir = tempfile::tempdir().unwrap();
        let ctx = Context::new(dir.path().to_path_buf(), Config::default());
        let mut out = Vec::new();
        run_session("list\n".as_bytes(), &mut out, &ctx, false).unwrap();
        let text = String::from_utf8(out).unwrap();
        assert!(text.contains("integrator: apply_ready, check_conflicts"));
    }
}
