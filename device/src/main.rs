mod bus;
mod channel;
mod host;
mod link;
mod platform;
mod store;
mod updater;

#[tokio::main(flavor = "current_thread")]
async fn main() -> anyhow::Result<()> {
    host::run().await
}
