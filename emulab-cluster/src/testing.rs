//! Recording process runner for unit and integration tests.

use std::collections::HashSet;
use std::io;
use std::sync::Arc;
use async_trait::async_trait;
use parking_lot::Mutex;

use crate::error::{ClusterError, ClusterResult};
use crate::process::{CommandOutput, Invocation, ProcessRunner};

/// Canned reply for a matched invocation
#[derive(Debug, Clone)]
pub enum Reply {
    /// Process ran and produced this output
    Output(CommandOutput),
    /// Program could not be spawned
    Missing,
}

type Matcher = Box<dyn Fn(&Invocation) -> bool + Send + Sync>;

struct Rule {
    matcher: Matcher,
    reply: Reply,
}

/// A [`ProcessRunner`] that records every invocation and answers from a
/// list of rules. The first matching rule wins; unmatched invocations
/// succeed with empty output.
#[derive(Clone, Default)]
pub struct RecordingRunner {
    rules: Arc<Mutex<Vec<Rule>>>,
    calls: Arc<Mutex<Vec<Invocation>>>,
    programs: Arc<Mutex<HashSet<String>>>,
}

impl RecordingRunner {
    /// Runner with no rules and no local programs
    pub fn new() -> Self {
        Self::default()
    }

    /// Mark a program as present on the local PATH
    pub fn with_program(self, program: &str) -> Self {
        self.programs.lock().insert(program.to_string());
        self
    }

    /// Answer invocations whose rendered form contains `pattern`
    pub fn respond(&self, pattern: &str, reply: Reply) -> &Self {
        let pattern = pattern.to_string();
        self.respond_when(move |inv| inv.to_string().contains(&pattern), reply)
    }

    /// Answer invocations accepted by `matcher`
    pub fn respond_when<F>(&self, matcher: F, reply: Reply) -> &Self
    where
        F: Fn(&Invocation) -> bool + Send + Sync + 'static,
    {
        self.rules.lock().push(Rule {
            matcher: Box::new(matcher),
            reply,
        });
        self
    }

    /// Every invocation so far, in order
    pub fn calls(&self) -> Vec<Invocation> {
        self.calls.lock().clone()
    }

    /// Rendered invocations, in order
    pub fn rendered_calls(&self) -> Vec<String> {
        self.calls.lock().iter().map(|c| c.to_string()).collect()
    }

    /// Number of invocations containing `pattern`
    pub fn count(&self, pattern: &str) -> usize {
        self.calls
            .lock()
            .iter()
            .filter(|c| c.to_string().contains(pattern))
            .count()
    }

    /// Forget recorded invocations, keeping rules
    pub fn clear_calls(&self) {
        self.calls.lock().clear();
    }

    fn answer(&self, invocation: &Invocation) -> ClusterResult<CommandOutput> {
        self.calls.lock().push(invocation.clone());
        let reply = self
            .rules
            .lock()
            .iter()
            .find(|rule| (rule.matcher)(invocation))
            .map(|rule| rule.reply.clone());

        match reply {
            Some(Reply::Output(output)) => Ok(output),
            Some(Reply::Missing) => Err(ClusterError::SpawnError {
                program: invocation.program.clone(),
                source: io::Error::new(io::ErrorKind::NotFound, "not installed"),
            }),
            None => Ok(CommandOutput::success("")),
        }
    }
}

#[async_trait]
impl ProcessRunner for RecordingRunner {
    async fn capture(&self, invocation: &Invocation) -> ClusterResult<CommandOutput> {
        self.answer(invocation)
    }

    async fn run(&self, invocation: &Invocation) -> ClusterResult<i32> {
        self.answer(invocation).map(|output| output.status)
    }

    fn program_exists(&self, program: &str) -> bool {
        self.programs.lock().contains(program)
    }
}

/// A small two-host manifest (`server-1`, `client-1`)
pub const TWO_HOST_MANIFEST: &str = r#"<rspec xmlns="http://www.geni.net/resources/rspec/3" type="manifest">
  <node client_id="server-1"><host name="server-1" ipv4="10.0.0.1"/></node>
  <node client_id="client-1"><host name="client-1" ipv4="10.0.0.2"/></node>
</rspec>"#;

/// Successful reply carrying `stdout`
pub fn ok(stdout: &str) -> Reply {
    Reply::Output(CommandOutput::success(stdout))
}

/// Failed reply with `status`
pub fn fail(status: i32) -> Reply {
    Reply::Output(CommandOutput::failure(status))
}
