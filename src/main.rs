use std::process;

fn main() {
    if let Err(err) = cadence::app::run() {
        eprintln!("fatal: {err:#}");
        process::exit(1);
    }
}
