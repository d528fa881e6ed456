/// ICE agent role (RFC 5245 §3): the controlling agent nominates pairs,
/// the controlled agent waits for nomination.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum IceRole {
    Controlling,
    Controlled,
}

impl IceRole {
    pub fn is_controlling(self) -> bool {
        matches!(self, IceRole::Controlling)
    }

    pub fn flipped(self) -> Self {
        match self {
            IceRole::Controlling => IceRole::Controlled,
            IceRole::Controlled => IceRole::Controlling,
        }
    }
}
