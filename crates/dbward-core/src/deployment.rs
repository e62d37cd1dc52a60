/// Production vs development deployment mode. Read once at startup and
/// never changed; several fail-closed decisions key off it (quota engine
/// construction, whether a missing quota engine is tolerated at all).
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Deployment {
    Production,
    Development,
}

impl Deployment {
    pub fn is_production(self) -> bool {
        matches!(self, Deployment::Production)
    }
}
