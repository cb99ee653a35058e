//! Shared fixtures for unit tests

use quorumfs_core::{Command, StateMachine};

/// A fixed-width numeric command.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct TestCommand(pub u64);

impl Command for TestCommand {
    fn size(&self) -> usize {
        8
    }

    fn serialize(&self, buf: &mut [u8]) {
        buf.copy_from_slice(&self.0.to_be_bytes());
    }

    fn deserialize(buf: &[u8]) -> Self {
        let mut raw = [0u8; 8];
        raw.copy_from_slice(&buf[..8]);
        Self(u64::from_be_bytes(raw))
    }
}

/// Records every applied command, in order.
#[derive(Debug, Default)]
pub struct RegisterMachine {
    pub applied: Vec<u64>,
}

impl StateMachine for RegisterMachine {
    type Command = TestCommand;

    fn apply(&mut self, cmd: &TestCommand) {
        self.applied.push(cmd.0);
    }

    fn snapshot(&self) -> Vec<u8> {
        bincode::serialize(&self.applied).unwrap()
    }

    fn apply_snapshot(&mut self, bytes: &[u8]) {
        self.applied = bincode::deserialize(bytes).unwrap();
    }
}
