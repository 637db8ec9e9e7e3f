mod domain;
mod infrastructure;
mod runtime;

use tracing::info;

use crate::domain::settings::SettingsService;
use crate::infrastructure::logging;
use crate::runtime::BridgeRuntime;

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let settings = SettingsService::new()?;
    let _logging_guard = logging::init_logger(&settings.get().log_settings)?;

    info!("Starting usbmux bridge");
    BridgeRuntime::new(settings.get().clone()).run().await
}
