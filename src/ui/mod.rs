mod status;

pub use status::{print_command_status, CommandStatus};
