use std::process::ExitCode;

fn main() -> ExitCode {
    researchkit_cli::run()
}
