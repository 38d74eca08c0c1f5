//! `localturn unload`: release the model through the coordinator's
//! unload role.

use std::path::PathBuf;

use anyhow::Context;
use lt_domain::config::Config;

use crate::bootstrap;

pub async fn unload(config: Config, replay: Option<PathBuf>) -> anyhow::Result<()> {
    let session = bootstrap::build_session(&config, replay.as_deref(), 0)?;
    let performed = session.unload_model().await.context("unloading model")?;
    if performed {
        println!("model unloaded");
    } else {
        println!("model was already unloaded by another caller");
    }
    Ok(())
}
