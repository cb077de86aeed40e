//! Cluster management command builders.

use crate::core::command::Cmd;

/// Creates a CLUSTER SLOTS command.
///
/// The reply maps slot ranges to their master (and replica) addresses and is
/// the source of every topology refresh.
pub fn cluster_slots() -> Cmd {
    Cmd::new("CLUSTER").arg("SLOTS")
}

/// Creates an ASKING command.
///
/// Sent right before a command that received an `ASK` redirect; the flag only
/// covers the immediately following command on the same connection.
pub fn asking() -> Cmd {
    Cmd::new("ASKING")
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::proto::frame::Frame;

    #[test]
    fn test_cluster_slots_cmd() {
        assert_eq!(
            cluster_slots().into_frame(),
            Frame::Array(vec![Frame::bulk("CLUSTER"), Frame::bulk("SLOTS")])
        );
    }

    #[test]
    fn test_asking_cmd() {
        let cmd = asking();
        assert_eq!(cmd.keys().count(), 0);
        assert_eq!(cmd.into_frame(), Frame::Array(vec![Frame::bulk("ASKING")]));
    }
}
