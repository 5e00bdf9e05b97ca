use std::sync::Arc;

use skyrelay::{
    config::ClientConfig,
    controller::UavController,
    error::Error,
    media::source::{FileSource, MediaSource, UdpRtpSource},
    mesh::data_channel::DataChannelClient,
    signaling::websocket::WebsocketClient,
};
use tokio_util::sync::CancellationToken;
use tracing_subscriber::prelude::__tracing_subscriber_SubscriberExt;
use tracing_subscriber::util::SubscriberInitExt;

#[tokio::main]
async fn main() -> Result<(), Error> {
    tracing_subscriber::registry()
        .with(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "debug".into()),
        )
        .with(tracing_subscriber::fmt::layer())
        .init();

    let config = ClientConfig::from_env();
    let source: Arc<dyn MediaSource> = match &config.video_file {
        Some(path) => Arc::new(FileSource::new(path)),
        None => Arc::new(UdpRtpSource::new(config.rtp_port)),
    };

    let websocket = Arc::new(WebsocketClient::new(&config.signal_url));
    let data_channel = Arc::new(DataChannelClient::connect(&config, websocket.clone()).await?);
    let controller = UavController::new(config, source, data_channel, websocket);

    let cancel = CancellationToken::new();
    tokio::select! {
        _ = controller.run(cancel.clone()) => {}
        res = tokio::signal::ctrl_c() => {
            res?;
            tracing::info!("Shutting down");
            cancel.cancel();
        }
    }
    controller.close().await;
    Ok(())
}
