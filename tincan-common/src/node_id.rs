//! Node ID type

use snafu::Snafu;

/// The node ID of a CANopen node
///
/// Valid node IDs are 1..=127. The special value 255 represents an unconfigured device, which
/// produces no node-specific traffic.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[cfg_attr(feature = "defmt", derive(defmt::Format))]
pub enum NodeId {
    /// No ID has been assigned
    Unconfigured,
    /// A valid ID
    Configured(ConfiguredId),
}

/// A node ID guaranteed to be in 1..=127
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[cfg_attr(feature = "defmt", derive(defmt::Format))]
pub struct ConfiguredId(u8);

impl ConfiguredId {
    /// Validate a raw ID
    pub const fn new(value: u8) -> Result<Self, InvalidNodeIdError> {
        if value > 0 && value < 128 {
            Ok(ConfiguredId(value))
        } else {
            Err(InvalidNodeIdError { value })
        }
    }

    /// The raw ID value
    pub const fn raw(&self) -> u8 {
        self.0
    }
}

impl From<ConfiguredId> for u8 {
    fn from(value: ConfiguredId) -> Self {
        value.raw()
    }
}

impl NodeId {
    /// Validate a raw ID, accepting 255 as unconfigured
    pub const fn new(value: u8) -> Result<Self, InvalidNodeIdError> {
        if value == 255 {
            Ok(NodeId::Unconfigured)
        } else {
            match ConfiguredId::new(value) {
                Ok(id) => Ok(NodeId::Configured(id)),
                Err(e) => Err(e),
            }
        }
    }

    /// The raw ID value, 255 when unconfigured
    pub const fn raw(&self) -> u8 {
        match self {
            NodeId::Unconfigured => 255,
            NodeId::Configured(id) => id.0,
        }
    }

    /// True when a valid ID is assigned
    pub fn is_configured(&self) -> bool {
        matches!(self, NodeId::Configured(_))
    }
}

/// Error returned for node IDs outside 1..=127 and 255
#[derive(Debug, Clone, Copy, PartialEq, Eq, Snafu)]
#[snafu(display("Invalid node ID {value}"))]
pub struct InvalidNodeIdError {
    /// The rejected value
    pub value: u8,
}

impl TryFrom<u8> for NodeId {
    type Error = InvalidNodeIdError;

    fn try_from(value: u8) -> Result<Self, Self::Error> {
        NodeId::new(value)
    }
}

impl From<NodeId> for u8 {
    fn from(value: NodeId) -> Self {
        value.raw()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_node_id_range() {
        assert!(NodeId::new(0).is_err());
        assert_eq!(1, NodeId::new(1).unwrap().raw());
        assert_eq!(127, NodeId::new(127).unwrap().raw());
        assert_eq!(Err(InvalidNodeIdError { value: 128 }), NodeId::new(128));
        assert_eq!(Ok(NodeId::Unconfigured), NodeId::try_from(255));
        assert!(!NodeId::Unconfigured.is_configured());
    }
}
