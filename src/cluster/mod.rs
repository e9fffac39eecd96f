//! Cluster control plane: one [`master::Master`] orchestrates many
//! [`slave::Slave`]s, each running as its own task.

pub mod master;
pub mod slave;

pub use master::{Master, MinedBlock};
pub use slave::{spawn_slave, Slave, SlaveCommand, SlaveHandle, SlaveReply, ShardStatus};
