use squall::cli::run_squall;

fn main() {
    if let Err(err) = run_squall() {
        tracing::error!(error = %err, "squall failed");
        std::process::exit(1);
    }
}
