//! Classify server binary.
//!
use std::sync::Arc;

use anyhow::Result;
use camera::sensors::MediaDevices;
use clap::Parser;
use classify_server::{
    config::Config,
    controller::Controller,
    endpoints::router,
    meter::spawn_meter_logger,
    nn::{InferModel, MobileNetModel},
};
use env_logger::TimestampPrecision;

#[tokio::main]
async fn main() -> Result<()> {
    let config = Config::parse();

    // Setup logger
    env_logger::builder()
        .format_timestamp(Some(TimestampPrecision::Millis))
        .init();

    let addr = config.socket_addr()?;

    // Build the controller owning camera, model and results
    let devices: Arc<dyn MediaDevices> = Arc::new(config.devices());
    let (controller, comm) = Controller::new(devices, config.capture_timeout());

    // Load the model while the devices are enumerated
    let model_config = config.model_config();
    let model_dir = config.model_dir();
    let top_k = config.top_k;
    tokio::spawn(controller.run(async move {
        let model = MobileNetModel::load(model_config, &model_dir, top_k).await?;
        Ok::<_, anyhow::Error>(Arc::new(model) as Arc<dyn InferModel>)
    }));

    spawn_meter_logger();

    // Serve HTTP server
    log::info!("Serving on http://{}", addr);
    axum::Server::bind(&addr)
        .serve(router(Arc::new(comm)).into_make_service())
        .await?;

    Ok(())
}
