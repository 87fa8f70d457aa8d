//! `tfmux signals`

use tfmux::signal::Signal;

pub fn run() {
    for signal in Signal::all() {
        println!("{:>2}) {}", signal.code(), signal.name());
    }
}
