use reuse::app::run::main_with_error;

#[tokio::main]
async fn main() {
    if let Err(e) = main_with_error().await {
        eprintln!("reuse: {:#}", e);
        std::process::exit(1);
    }
}
