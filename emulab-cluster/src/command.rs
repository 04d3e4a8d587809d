//! Structured shell commands for remote execution.
//!
//! Remote steps are built as argument vectors and rendered into a single
//! shell string here, so callers never concatenate or quote by hand. The
//! rendered string is handed to `ssh`/`pdsh` as one argument and parsed
//! exactly once, by the remote shell.

use std::fmt;

/// How a step is chained to the step before it
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Connector {
    /// Run only if the previous step succeeded (`&&`)
    And,
    /// Run regardless of the previous step (`;`)
    Then,
}

impl Connector {
    fn as_str(&self) -> &'static str {
        match self {
            Connector::And => " && ",
            Connector::Then => "; ",
        }
    }
}

/// A single program invocation on the remote side
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ShellCommand {
    argv: Vec<String>,
    redirect: Option<String>,
}

impl ShellCommand {
    /// Start a command with the given program
    pub fn new(program: impl Into<String>) -> Self {
        ShellCommand {
            argv: vec![program.into()],
            redirect: None,
        }
    }

    /// Append an argument
    pub fn arg(mut self, arg: impl Into<String>) -> Self {
        self.argv.push(arg.into());
        self
    }

    /// Append several arguments
    pub fn args<I, S>(mut self, args: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.argv.extend(args.into_iter().map(Into::into));
        self
    }

    /// Send stdout and stderr to `path`
    pub fn redirect_all(mut self, path: impl Into<String>) -> Self {
        self.redirect = Some(path.into());
        self
    }

    /// Render as shell text
    pub fn render(&self) -> String {
        let mut out = self
            .argv
            .iter()
            .map(|arg| quote(arg))
            .collect::<Vec<_>>()
            .join(" ");
        if let Some(path) = &self.redirect {
            out.push_str(" > ");
            out.push_str(&quote(path));
            out.push_str(" 2>&1");
        }
        out
    }
}

impl fmt::Display for ShellCommand {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.render())
    }
}

/// An ordered sequence of commands forming one remote shell invocation
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Script {
    steps: Vec<(Connector, ShellCommand)>,
}

impl Script {
    /// Script with a single first step
    pub fn new(first: ShellCommand) -> Self {
        Script {
            steps: vec![(Connector::And, first)],
        }
    }

    /// Append a step that only runs if everything before it succeeded
    pub fn and(mut self, command: ShellCommand) -> Self {
        self.steps.push((Connector::And, command));
        self
    }

    /// Append a step that runs regardless of the previous step
    pub fn then(mut self, command: ShellCommand) -> Self {
        self.steps.push((Connector::Then, command));
        self
    }

    /// Number of steps
    pub fn len(&self) -> usize {
        self.steps.len()
    }

    /// Always false, a script has at least one step
    pub fn is_empty(&self) -> bool {
        self.steps.is_empty()
    }

    /// Render as shell text. Multi-step scripts run in a subshell so a
    /// leading `cd` does not leak into anything the caller appends.
    pub fn render(&self) -> String {
        let mut body = String::new();
        for (i, (connector, command)) in self.steps.iter().enumerate() {
            if i > 0 {
                body.push_str(connector.as_str());
            }
            body.push_str(&command.render());
        }
        if self.steps.len() > 1 {
            format!("({})", body)
        } else {
            body
        }
    }
}

impl From<ShellCommand> for Script {
    fn from(command: ShellCommand) -> Self {
        Script::new(command)
    }
}

impl fmt::Display for Script {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.render())
    }
}

/// Quote a word for a POSIX shell. Words made only of safe characters are
/// left alone; everything else is single-quoted with embedded single quotes
/// written as `'\''`.
pub fn quote(word: &str) -> String {
    if !word.is_empty() && word.chars().all(is_safe_char) {
        return word.to_string();
    }
    let mut out = String::with_capacity(word.len() + 2);
    out.push('\'');
    for c in word.chars() {
        if c == '\'' {
            out.push_str("'\\''");
        } else {
            out.push(c);
        }
    }
    out.push('\'');
    out
}

fn is_safe_char(c: char) -> bool {
    c.is_ascii_alphanumeric() || matches!(c, '-' | '_' | '.' | '/' | ':' | ',' | '=' | '+' | '@' | '%')
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_plain_words_unquoted() {
        let cmd = ShellCommand::new("pkill").arg("-f").arg("RAMCloud");
        assert_eq!(cmd.render(), "pkill -f RAMCloud");
    }

    #[test]
    fn test_quote_special_characters() {
        assert_eq!(quote("a b"), "'a b'");
        assert_eq!(quote(""), "''");
        assert_eq!(quote("$(rm -rf /)"), "'$(rm -rf /)'");
        assert_eq!(quote("logs/*"), "'logs/*'");
    }

    #[test]
    fn test_embedded_quotes() {
        assert_eq!(quote("say \"hi\""), "'say \"hi\"'");
        assert_eq!(quote("it's"), "'it'\\''s'");
    }

    #[test]
    fn test_redirect() {
        let cmd = ShellCommand::new("make")
            .arg("-j12")
            .redirect_all("/users/me/RAMCloud/build.log");
        assert_eq!(cmd.render(), "make -j12 > /users/me/RAMCloud/build.log 2>&1");
    }

    #[test]
    fn test_script_connectors() {
        let script = Script::new(ShellCommand::new("sudo").args(["chmod", "777", "/dev/sda4"]))
            .then(ShellCommand::new("sudo").args(["chmod", "777", "/dev/sdb"]));
        assert_eq!(
            script.render(),
            "(sudo chmod 777 /dev/sda4; sudo chmod 777 /dev/sdb)"
        );

        let script = Script::new(ShellCommand::new("cd").arg("/w"))
            .and(ShellCommand::new("make"));
        assert_eq!(script.render(), "(cd /w && make)");
    }

    #[test]
    fn test_single_step_script_has_no_subshell() {
        let script: Script = ShellCommand::new("pwd").into();
        assert_eq!(script.render(), "pwd");
        assert_eq!(script.len(), 1);
    }
}
