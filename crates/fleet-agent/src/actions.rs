use protocol::validation::{log_lines, working_dir};
use protocol::{validate_command, CommandKind, CommandSpec, ValidationError};

/// Concrete process invocation for one command.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ActionPlan {
    pub program: String,
    pub args: Vec<String>,
    pub working_dir: Option<String>,
    pub env: Vec<(String, String)>,
    /// `systemctl status` exits non-zero for inactive units; that is still
    /// a successful query.
    pub nonzero_ok: bool,
}

impl ActionPlan {
    fn new(program: &str, args: &[&str]) -> Self {
        Self {
            program: program.to_string(),
            args: args.iter().map(|arg| arg.to_string()).collect(),
            working_dir: None,
            env: Vec::new(),
            nonzero_ok: false,
        }
    }

    fn arg(mut self, arg: impl Into<String>) -> Self {
        self.args.push(arg.into());
        self
    }

    fn env(mut self, key: &str, value: &str) -> Self {
        self.env.push((key.to_string(), value.to_string()));
        self
    }

    /// Command line for logs.
    pub fn display(&self) -> String {
        std::iter::once(self.program.as_str())
            .chain(self.args.iter().map(String::as_str))
            .collect::<Vec<_>>()
            .join(" ")
    }
}

/// Validates the command and maps it to an argv. Targets are passed as a
/// single argument and never go through a shell.
pub fn plan(spec: &CommandSpec) -> Result<ActionPlan, ValidationError> {
    validate_command(spec)?;
    let target = spec.target.as_deref().unwrap_or_default();
    let action = spec.action.as_str();
    let plan = match spec.kind {
        CommandKind::PackageManager => {
            let base = match action {
                "update" => ActionPlan::new("apt-get", &["update", "-q"]),
                "upgrade" => ActionPlan::new("apt-get", &["upgrade", "-y", "-q"]),
                _ => ActionPlan::new("apt-get", &["dist-upgrade", "-y", "-q"]),
            };
            base.env("DEBIAN_FRONTEND", "noninteractive")
                .env("LANG", "C")
        }
        CommandKind::Container => match action.strip_prefix("compose_") {
            Some(compose) => {
                let mut plan = ActionPlan::new("docker", &["compose", "-p", target]);
                plan = match compose {
                    "up" => plan.arg("up").arg("-d"),
                    "down" => plan.arg("down"),
                    "restart" => plan.arg("restart"),
                    _ => plan.arg("logs").arg("--tail").arg("100").arg("--timestamps"),
                };
                plan.working_dir = working_dir(&spec.payload)?;
                plan
            }
            None if action == "logs" => {
                ActionPlan::new("docker", &["logs", "--tail", "100", "--timestamps", target])
            }
            None => ActionPlan::new("docker", &[action, target]),
        },
        CommandKind::ServiceUnit => {
            let mut plan = ActionPlan::new("systemctl", &[action, "--no-pager"]);
            if action == "status" {
                plan.nonzero_ok = true;
            }
            plan.arg("--").arg(target)
        }
        CommandKind::LogFetch => {
            let lines = log_lines(&spec.payload)?;
            ActionPlan::new("journalctl", &["-u", target, "--no-pager", "--output=short-iso"])
                .arg("-n")
                .arg(lines.to_string())
        }
    };
    Ok(plan)
}
