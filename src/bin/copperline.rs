use copperline_web::server::Server;

#[tokio::main]
async fn main() {
    copperline_log::init();
    if let Err(e) = Server::run().await {
        eprintln!("copperline exited: {e:#}");
    }
}
