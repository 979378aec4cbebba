use std::process::ExitCode;

fn main() -> ExitCode {
    hatchd::run(hatchd::worker::run)
}
