#[tokio::main]
async fn main() -> std::process::ExitCode {
    match loglens::run().await {
        Ok(()) => std::process::ExitCode::SUCCESS,
        Err(error) => {
            eprintln!("loglens: {error}");
            std::process::ExitCode::FAILURE
        }
    }
}
