use stagecoach_core::config::ConditionalPolicyConfig;
use stagecoach_core::Unit;

/// Name/dependency pattern heuristic for conditional units.
///
/// This is a coarse proxy for data-flow safety, not a proof. It only widens
/// what the planner may propose when the caller explicitly allows
/// conditional parallelization.
#[derive(Debug, Clone, Default)]
pub struct ConditionalPolicy {
    config: ConditionalPolicyConfig,
}

impl ConditionalPolicy {
    pub fn new(config: ConditionalPolicyConfig) -> Self {
        Self { config }
    }

    /// `Ok(())` when the unit may be proposed at medium safety, otherwise the reason it may not.
    pub fn evaluate(&self, unit: &Unit) -> Result<(), String> {
        if let Some(p) = matching(&self.config.deny_name_patterns, &unit.name) {
            return Err(format!("{} matches deny pattern '{p}'", unit.name));
        }
        if matching(&self.config.allow_name_patterns, &unit.name).is_none() {
            return Err(format!("{} matches no allow pattern", unit.name));
        }
        for dep in &unit.dependencies {
            if let Some(p) = matching(&self.config.deny_dependency_patterns, dep) {
                return Err(format!("{} depends on {dep}, which matches '{p}'", unit.name));
            }
        }
        Ok(())
    }

    pub fn permits(&self, unit: &Unit) -> bool {
        self.evaluate(unit).is_ok()
    }
}

fn matching<'a>(patterns: &'a [String], name: &str) -> Option<&'a str> {
    patterns
        .iter()
        .find(|p| !p.is_empty() && name.contains(p.as_str()))
        .map(String::as_str)
}
