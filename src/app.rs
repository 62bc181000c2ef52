//! Wiring: every service is built once here and handed to whatever needs it.

use std::sync::Arc;

use anyhow::{Context, Result};

use crate::client::InferenceClient;
use crate::config::TetherConfig;
use crate::context::{ContextAssembler, EntryLookup};
use crate::db;
use crate::memory::MemoryStore;
use crate::supervisor::Supervisor;

pub struct App {
    pub config: TetherConfig,
    pub supervisor: Supervisor,
    pub client: Arc<InferenceClient>,
    pub memory: Arc<MemoryStore>,
    pub context: ContextAssembler,
}

impl App {
    /// Open the memory database and construct the services. The supervisor
    /// actor starts idle; call [`Supervisor::start`] to launch the server.
    pub fn build(mut config: TetherConfig, entries: Arc<dyn EntryLookup>) -> Result<Self> {
        config.resolve_server_address()?;
        let supervisor =
            Supervisor::new(&config.supervisor).context("failed to create supervisor")?;
        let mut client_config = config.client.clone();
        client_config.base_url = Some(config.server_url());
        let client = Arc::new(
            InferenceClient::new(&client_config).context("failed to create inference client")?,
        );

        let conn = db::open_database(config.resolved_db_path())?;
        let memory = Arc::new(MemoryStore::new(
            conn,
            client.clone(),
            client.clone(),
            config.resolved_archive_dir(),
            config.memory.max_memories,
        ));
        let context = ContextAssembler::new(memory.clone(), entries, config.context.clone());

        Ok(Self {
            config,
            supervisor,
            client,
            memory,
            context,
        })
    }
}
