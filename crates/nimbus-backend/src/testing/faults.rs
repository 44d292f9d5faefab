use crate::error::{BackendError, Result};
use std::sync::Mutex;

#[derive(Debug, Clone)]
struct Fault {
    op: String,
    target: Option<String>,
    remaining: Option<usize>,
}

/// Failure injection shared by the fakes
#[derive(Debug, Default)]
pub struct Faults {
    rules: Mutex<Vec<Fault>>,
}

impl Faults {
    /// Every call to `op` fails
    pub fn fail(&self, op: &str) {
        self.push(op, None, None);
    }

    /// Calls to `op` whose target equals `target` fail
    pub fn fail_on(&self, op: &str, target: &str) {
        self.push(op, Some(target.to_string()), None);
    }

    /// The next `times` calls to `op` fail
    pub fn fail_times(&self, op: &str, times: usize) {
        self.push(op, None, Some(times));
    }

    pub fn clear(&self) {
        self.lock().clear();
    }

    fn push(&self, op: &str, target: Option<String>, remaining: Option<usize>) {
        self.lock().push(Fault {
            op: op.to_string(),
            target,
            remaining,
        });
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, Vec<Fault>> {
        self.rules.lock().unwrap_or_else(|e| e.into_inner())
    }

    pub(crate) fn check(&self, op: &str, target: &str) -> Result<()> {
        let mut rules = self.lock();
        let hit = rules.iter().position(|f| {
            f.op == op && f.target.as_deref().is_none_or(|t| t == target)
        });
        let Some(index) = hit else {
            return Ok(());
        };
        if let Some(remaining) = rules[index].remaining.as_mut() {
            *remaining -= 1;
            if *remaining == 0 {
                rules.remove(index);
            }
        }
        Err(BackendError::Api(format!("injected failure: {} {}", op, target)))
    }
}

/// One recorded backend call
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Call {
    pub op: String,
    pub args: Vec<String>,
}

/// Ordered log of calls, including ones that failed
#[derive(Debug, Default)]
pub struct CallLog {
    calls: Mutex<Vec<Call>>,
}

impl CallLog {
    pub(crate) fn record(&self, op: &str, args: &[&str]) {
        self.lock().push(Call {
            op: op.to_string(),
            args: args.iter().map(|a| a.to_string()).collect(),
        });
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, Vec<Call>> {
        self.calls.lock().unwrap_or_else(|e| e.into_inner())
    }

    pub fn all(&self) -> Vec<Call> {
        self.lock().clone()
    }

    /// Arguments of every call to `op`
    pub fn of(&self, op: &str) -> Vec<Vec<String>> {
        self.lock()
            .iter()
            .filter(|c| c.op == op)
            .map(|c| c.args.clone())
            .collect()
    }

    pub fn count(&self, op: &str) -> usize {
        self.lock().iter().filter(|c| c.op == op).count()
    }

    pub fn ops(&self) -> Vec<String> {
        self.lock().iter().map(|c| c.op.clone()).collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_targeted_fault() {
        let faults = Faults::default();
        faults.fail_on("add_flow_rule", "br-b");
        assert!(faults.check("add_flow_rule", "br-a").is_ok());
        assert!(faults.check("add_flow_rule", "br-b").is_err());
        assert!(faults.check("add_flow_rule", "br-b").is_err());
    }

    #[test]
    fn test_counted_fault_expires() {
        let faults = Faults::default();
        faults.fail_times("create_volume", 1);
        assert!(faults.check("create_volume", "v").is_err());
        assert!(faults.check("create_volume", "v").is_ok());
    }
}
