#[tokio::main]
async fn main() {
    reviews_backend::start_server().await;
}
