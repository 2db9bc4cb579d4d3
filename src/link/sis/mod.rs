// IndraDrive SIS link
//
// Serial interface protocol of Bosch Rexroth IndraDrive controllers:
// - telegram: frame layout, checksum, parameter attributes
// - bus: request/reaction exchange and procedure commands over a port
// - drive: the DriveLink operations expressed as parameter traffic

mod bus;
mod drive;
pub mod telegram;

pub use bus::{MAX_COMMAND_POLLS, Port, SisBus, SisError};
pub use drive::{DRIVEMODE_SEQUENCER, DRIVEMODE_SPEEDCONTROL, SisDriveLink};
