#[tokio::main]
async fn main() {
    udpunch::node::main::run_node().await;
}
