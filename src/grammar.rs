//! The `/role::command(args)` command language.
//!
//! [`parse`] is total: anything that does not have the exact shape returns
//! `None`. [`validate`] checks a parsed command against the registry of known
//! commands for its role class and enforces argument counts.

use std::fmt;
use std::sync::OnceLock;

use regex::Regex;
use serde::Serialize;

/// Which handler table a command's role routes to.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum RoleClass {
    Orchestrator,
    Integrator,
    /// Any agent role (`backend_developer`, `qa`, ...).
    Role,
}

impl RoleClass {
    pub fn of(role: &str) -> Self {
        match role {
            "orchestrator" => Self::Orchestrator,
            "integrator" => Self::Integrator,
            _ => Self::Role,
        }
    }

    pub const fn as_str(self) -> &'static str {
        match self {
            Self::Orchestrator => "orchestrator",
            Self::Integrator => "integrator",
            Self::Role => "role",
        }
    }

    /// Commands known for this class, in registration order.
    pub const fn commands(self) -> &'static [&'static str] {
        match self {
            Self::Orchestrator => &[
                "start_workflow",
                "generate_iteration",
                "launch_agents",
                "apply_ready_to",
                "archive_tasks",
                "monitor_progress",
            ],
            Self::Integrator => &["apply_ready", "check_conflicts", "distribute_tasks"],
            Self::Role => &["start_task", "start_next", "report_token_usage"],
        }
    }

    pub const ALL: [Self; 3] = [Self::Orchestrator, Self::Integrator, Self::Role];
}

impl fmt::Display for RoleClass {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// A parsed slash command. Never mutated after parsing.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct ParsedCommand {
    role: String,
    command: String,
    args: Vec<String>,
    raw: String,
}

impl ParsedCommand {
    /// Build a command directly, e.g. when one handler delegates to another.
    /// `raw` is set to the canonical form.
    pub fn new(role: &str, command: &str, args: Vec<String>) -> Self {
        let mut cmd = Self {
            role: role.to_string(),
            command: command.to_string(),
            args,
            raw: String::new(),
        };
        cmd.raw = cmd.to_string();
        cmd
    }

    pub fn role(&self) -> &str {
        &self.role
    }

    pub fn command(&self) -> &str {
        &self.command
    }

    pub fn args(&self) -> &[String] {
        &self.args
    }

    pub fn raw(&self) -> &str {
        &self.raw
    }

    pub fn role_class(&self) -> RoleClass {
        RoleClass::of(&self.role)
    }
}

impl fmt::Display for ParsedCommand {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "/{}::{}({})", self.role, self.command, self.args.join(", "))
    }
}

fn command_re() -> &'static Regex {
    static RE: OnceLock<Regex> = OnceLock::new();
    RE.get_or_init(|| {
        Regex::new(r"^/([\w-]+)::([\w-]+)(?:\(([^)]*)\))?$").expect("command pattern compiles")
    })
}

/// Parse one line of text into a command. Returns None on any non-matching input.
pub fn parse(text: &str) -> Option<ParsedCommand> {
    let raw = text.trim();
    let caps = command_re().captures(raw)?;
    let args = caps
        .get(3)
        .map(|m| {
            m.as_str()
                .split(',')
                .map(|a| a.trim().trim_matches(|c| c == '"' || c == '\'').trim())
                .filter(|a| !a.is_empty())
                .map(str::to_string)
                .collect()
        })
        .unwrap_or_default();

    Some(ParsedCommand {
        role: caps[1].to_string(),
        command: caps[2].to_string(),
        args,
        raw: raw.to_string(),
    })
}

/// Check a command against the registry. Pure; the error is a human-readable reason.
pub fn validate(cmd: &ParsedCommand) -> Result<(), String> {
    let class = cmd.role_class();
    let name = cmd.command();
    if !class.commands().contains(&name) {
        return Err(match class {
            RoleClass::Orchestrator => format!("Unknown orchestrator command: {name}"),
            RoleClass::Integrator => format!("Unknown integrator command: {name}"),
            RoleClass::Role => format!("Unknown role command: {name}"),
        });
    }

    let args = cmd.args();
    let n = args.len();
    match (class, name) {
        (RoleClass::Orchestrator, "start_workflow") if n != 3 => Err(format!(
            "start_workflow requires 3 args (workflow, phase, iteration), got {n}"
        )),
        (RoleClass::Orchestrator, "generate_iteration") if n != 1 => Err(format!(
            "generate_iteration requires 1 arg (workflow:phase:iteration), got {n}"
        )),
        (RoleClass::Orchestrator, "launch_agents") => {
            if n == 0 {
                return Err("launch_agents requires at least 1 arg (iteration)".to_string());
            }
            if n > 1 + LaunchOptions::MAX_FLAGS {
                return Err(format!(
                    "launch_agents accepts up to {} args (iteration plus flags), got {n}",
                    1 + LaunchOptions::MAX_FLAGS
                ));
            }
            LaunchOptions::from_args(args).map(|_| ())
        }
        (RoleClass::Orchestrator, "apply_ready_to") => {
            if !(1..=2).contains(&n) {
                return Err(format!(
                    "apply_ready_to requires 1-2 args (target_branch[, dry-run]), got {n}"
                ));
            }
            trailing_dry_run("apply_ready_to", args).map(|_| ())
        }
        (RoleClass::Orchestrator, "archive_tasks") => {
            if !(1..=2).contains(&n) {
                return Err(format!(
                    "archive_tasks requires 1-2 args (iteration[, dry-run]), got {n}"
                ));
            }
            trailing_dry_run("archive_tasks", args).map(|_| ())
        }
        (RoleClass::Orchestrator, "monitor_progress") if n != 1 => Err(format!(
            "monitor_progress requires 1 arg (iteration), got {n}"
        )),
        (RoleClass::Integrator, "apply_ready") => {
            if n > 2 {
                return Err(format!(
                    "apply_ready accepts 0-2 args (optional: <target-branch>, dry-run), got {n}"
                ));
            }
            if args.iter().any(|a| a.trim().is_empty()) {
                return Err("apply_ready args must be non-empty".to_string());
            }
            if args.iter().filter(|a| !is_dry_run(a)).count() > 1 {
                return Err(
                    "apply_ready accepts at most one target branch override (plus optional dry-run)"
                        .to_string(),
                );
            }
            Ok(())
        }
        (RoleClass::Integrator, "check_conflicts") if n != 1 => Err(format!(
            "check_conflicts requires 1 arg (branch), got {n}"
        )),
        (RoleClass::Integrator, "distribute_tasks") if n != 1 => Err(format!(
            "distribute_tasks requires 1 arg (iteration), got {n}"
        )),
        (RoleClass::Role, "start_task") if n != 1 => Err(format!(
            "start_task requires 1 arg (task_id), got {n}"
        )),
        (RoleClass::Role, "start_next" | "report_token_usage") if n != 0 => {
            Err(format!("{name} requires 0 args, got {n}"))
        }
        _ => Ok(()),
    }
}

/// `dry-run` flag token (underscore spelling accepted).
pub fn is_dry_run(token: &str) -> bool {
    matches!(token, "dry-run" | "dry_run")
}

/// For `(subject[, dry-run])` commands: the second token, if present, must be the flag.
pub fn trailing_dry_run(command: &str, args: &[String]) -> Result<bool, String> {
    match args.get(1) {
        None => Ok(false),
        Some(flag) if is_dry_run(flag) => Ok(true),
        Some(other) => Err(format!(
            "{command}: unexpected argument '{other}' (only dry-run may follow)"
        )),
    }
}

/// Flags accepted by `launch_agents(iteration, ...)`. Order-independent.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct LaunchOptions {
    pub iteration: String,
    pub dry_run: bool,
    pub parallel: bool,
    /// Converge after the run (set by any `apply-ready*` token).
    pub apply_ready: bool,
    /// Converge after every success (sequential) or every batch (parallel).
    pub apply_ready_each: bool,
    pub apply_ready_target: Option<String>,
    pub archive_tasks: bool,
    pub max_parallel: Option<usize>,
}

impl LaunchOptions {
    pub const MAX_FLAGS: usize = 6;

    pub fn from_args(args: &[String]) -> Result<Self, String> {
        let (iteration, flags) = args
            .split_first()
            .ok_or_else(|| "launch_agents requires at least 1 arg (iteration)".to_string())?;
        let mut opts = Self {
            iteration: iteration.clone(),
            ..Self::default()
        };

        for flag in flags {
            let normalized = flag.replace('_', "-");
            match normalized.as_str() {
                "dry-run" => opts.dry_run = true,
                "parallel" => opts.parallel = true,
                "apply-ready" => opts.apply_ready = true,
                "apply-ready-each" => {
                    opts.apply_ready = true;
                    opts.apply_ready_each = true;
                }
                "archive-tasks" => opts.archive_tasks = true,
                _ => {
                    if let Some(target) = flag
                        .strip_prefix("apply-ready=")
                        .or_else(|| flag.strip_prefix("apply_ready="))
                    {
                        opts.apply_ready = true;
                        let target = target.trim();
                        if !target.is_empty() {
                            opts.apply_ready_target = Some(target.to_string());
                        }
                    } else if let Some(n) = normalized.strip_prefix("max-parallel=") {
                        opts.max_parallel = Some(parse_parallel(n, flag)?);
                    } else if flag.chars().all(|c| c.is_ascii_digit()) {
                        opts.max_parallel = Some(parse_parallel(flag, flag)?);
                    } else {
                        return Err(format!("launch_agents: unknown flag '{flag}'"));
                    }
                }
            }
        }
        Ok(opts)
    }
}

fn parse_parallel(value: &str, flag: &str) -> Result<usize, String> {
    value
        .trim()
        .parse()
        .map_err(|_| format!("launch_agents: invalid max_parallel in '{flag}'"))
}

#[cfg(test)]
mod tests {
    use super::*;

    fn args(items: &[&str]) -> Vec<String> {
        items.iter().map(|s| s.to_string()).collect()
    }

    #[test]
    fn parse_command_with_args() {
        let cmd = parse("/orchestrator::start_workflow(refine, phase-1, iter-1)").unwrap();
        assert_eq!(cmd.role(), "orchestrator");
        assert_eq!(cmd.command(), "start_workflow");
        assert_eq!(cmd.args(), args(&["refine", "phase-1", "iter-1"]).as_slice());
        assert_eq!(cmd.role_class(), RoleClass::Orchestrator);
    }

    #[test]
    fn parse_bare_command() {
        let cmd = parse("  /integrator::apply_ready  ").unwrap();
        assert!(cmd.args().is_empty());
        assert_eq!(cmd.raw(), "/integrator::apply_ready");
        assert_eq!(cmd.role_class(), RoleClass::Integrator);
    }

    #[test]
    fn parse_strips_quotes_and_drops_empty_args() {
        let cmd = parse(r#"/qa::start_task( "T-1" , , 'x' )"#).unwrap();
        assert_eq!(cmd.args(), args(&["T-1", "x"]).as_slice());
        assert_eq!(cmd.role_class(), RoleClass::Role);

        let cmd = parse("/integrator::apply_ready()").unwrap();
        assert!(cmd.args().is_empty());
    }

    #[test]
    fn parse_rejects_malformed_input() {
        assert!(parse("not a command").is_none());
        assert!(parse("/bad syntax").is_none());
        assert!(parse("").is_none());
        assert!(parse("/role:command").is_none());
        assert!(parse("/role::command(unclosed").is_none());
        assert!(parse("/role::command(a) trailing").is_none());
        assert!(parse("/ro le::cmd").is_none());
    }

    #[test]
    fn canonical_form_round_trips() {
        for text in [
            "/orchestrator::launch_agents(iter-1, parallel, 2)",
            "/backend_developer::start_next",
            "/integrator::apply_ready(main, dry-run)",
        ] {
            let cmd = parse(text).unwrap();
            let again = parse(&cmd.to_string()).unwrap();
            assert_eq!(again.role(), cmd.role());
            assert_eq!(again.command(), cmd.command());
            assert_eq!(again.args(), cmd.args());
        }
        let cmd = parse("/qa::start_next").unwrap();
        assert_eq!(cmd.to_string(), "/qa::start_next()");
    }

    #[test]
    fn new_sets_canonical_raw() {
        let cmd = ParsedCommand::new("integrator", "apply_ready", args(&["main"]));
        assert_eq!(cmd.raw(), "/integrator::apply_ready(main)");
    }

    #[test]
    fn validate_known_commands() {
        for text in [
            "/orchestrator::start_workflow(w, p, i)",
            "/orchestrator::launch_agents(i)",
            "/orchestrator::launch_agents(i, parallel, 3, apply-ready-each, archive-tasks, dry-run, apply-ready=main)",
            "/orchestrator::apply_ready_to(main)",
            "/orchestrator::apply_ready_to(main, dry-run)",
            "/orchestrator::archive_tasks(i, dry-run)",
            "/orchestrator::monitor_progress(i)",
            "/integrator::apply_ready",
            "/integrator::apply_ready(dry-run)",
            "/integrator::apply_ready(main, dry-run)",
            "/integrator::apply_ready(dry-run, main)",
            "/integrator::check_conflicts(feat/qa/t1)",
            "/orchestrator::generate_iteration(refine:phase-1:iter-1)",
            "/integrator::distribute_tasks(iter-1)",
            "/qa::start_task(T-1)",
            "/qa::start_next",
            "/qa::report_token_usage",
        ] {
            let cmd = parse(text).unwrap();
            assert_eq!(validate(&cmd), Ok(()), "{text}");
        }
    }

    #[test]
    fn validate_rejects_bad_arity_and_unknown_names() {
        for (text, needle) in [
            ("/orchestrator::start_workflow(w, p)", "requires 3 args"),
            ("/orchestrator::launch_agents", "at least 1 arg"),
            ("/orchestrator::launch_agents(i, bogus)", "unknown flag"),
            ("/orchestrator::apply_ready_to(a, b, c)", "1-2 args"),
            ("/orchestrator::apply_ready_to(a, b)", "unexpected argument"),
            ("/orchestrator::monitor_progress", "requires 1 arg"),
            ("/orchestrator::explode", "Unknown orchestrator command"),
            ("/integrator::apply_ready(a, b)", "at most one target"),
            ("/integrator::apply_ready(a, b, dry-run)", "0-2 args"),
            ("/integrator::check_conflicts", "requires 1 arg"),
            ("/orchestrator::generate_iteration(w, p, i)", "generate_iteration requires 1 arg"),
            ("/integrator::distribute_tasks", "distribute_tasks requires 1 arg"),
            ("/qa::start_task", "requires 1 arg"),
            ("/qa::start_next(x)", "requires 0 args"),
            ("/qa::deploy", "Unknown role command"),
        ] {
            let cmd = parse(text).unwrap();
            let err = validate(&cmd).unwrap_err();
            assert!(err.contains(needle), "{text}: {err}");
        }
    }

    #[test]
    fn validate_launch_agents_arg_ceiling() {
        let cmd = ParsedCommand::new(
            "orchestrator",
            "launch_agents",
            args(&["i", "dry-run", "parallel", "2", "apply-ready", "apply-ready-each", "archive-tasks", "3"]),
        );
        assert!(validate(&cmd).unwrap_err().contains("up to 7 args"));
    }

    #[test]
    fn launch_options_parse_flags() {
        let opts = LaunchOptions::from_args(&args(&[
            "iter-2",
            "parallel",
            "max_parallel=4",
            "apply_ready=integration/x",
            "archive_tasks",
        ]))
        .unwrap();
        assert_eq!(opts.iteration, "iter-2");
        assert!(opts.parallel);
        assert_eq!(opts.max_parallel, Some(4));
        assert!(opts.apply_ready);
        assert!(!opts.apply_ready_each);
        assert_eq!(opts.apply_ready_target.as_deref(), Some("integration/x"));
        assert!(opts.archive_tasks);
        assert!(!opts.dry_run);

        let opts = LaunchOptions::from_args(&args(&["i", "apply-ready-each", "2", "dry_run"])).unwrap();
        assert!(opts.apply_ready && opts.apply_ready_each && opts.dry_run);
        assert_eq!(opts.max_parallel, Some(2));
    }

    #[test]
    fn role_class_registry() {
        assert_eq!(RoleClass::of("orchestrator"), RoleClass::Orchestrator);
        assert_eq!(RoleClass::of("integrator"), RoleClass::Integrator);
        assert_eq!(RoleClass::of("anything-else"), RoleClass::Role);
        assert!(RoleClass::Integrator.commands().contains(&"check_conflicts"));
    }
}
