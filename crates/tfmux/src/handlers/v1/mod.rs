//! V1 API handlers.

mod processes;
mod settings;

pub use processes::{
    create_process, delete_process, get_process, list_processes, read_output, stop_process,
    stream_output, write_input,
};
pub use settings::get_settings;
