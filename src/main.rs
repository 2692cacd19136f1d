use cli::Cli;

#[tokio::main]
async fn main() {
    if let Err(err) = Cli::handle().await {
        eprintln!("Error: {err}");
        std::process::exit(1);
    }
}
