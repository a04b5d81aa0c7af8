use fail::FailScenario;

/// Failpoints configured for the lifetime of the guard.
///
/// Dropping the guard turns every configured failpoint off again.
pub struct FailpointGuard<'a> {
    _scenario: FailScenario<'a>,
    names: Vec<String>,
}

impl<'a> FailpointGuard<'a> {
    /// Configures each `(failpoint, action)` pair, e.g. `("incremental.before_merge", "1*return(timed_retry)")`.
    pub fn configure(failpoints: &[(&str, &str)]) -> FailpointGuard<'a> {
        let scenario = FailScenario::setup();

        let mut names = Vec::with_capacity(failpoints.len());
        for (name, action) in failpoints {
            fail::cfg(*name, action).unwrap();
            names.push(name.to_string());
        }

        Self {
            _scenario: scenario,
            names,
        }
    }
}

impl Drop for FailpointGuard<'_> {
    fn drop(&mut self) {
        for name in &self.names {
            fail::remove(name);
        }
    }
}
