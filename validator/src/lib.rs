// Copyright © Sawtooth Contributors
// SPDX-License-Identifier: Apache-2.0

//! Wires the validator core together: storage, state, execution, journal,
//! events, and (optionally) the peer network, plus the genesis bootstrap
//! path that runs when a `genesis.batch` file is present and no chain head
//! exists.

mod adapters;

pub use adapters::BroadcastFanout;

use adapters::{GossipGlue, PeerRequestSender};
use crossbeam_channel::Sender;
use sawtooth_chain_store::ChainStore;
use sawtooth_consensus::{ConsensusEngine, ConsensusRegistry};
use sawtooth_crypto::PrivateKey;
use sawtooth_events::{EventBroadcaster, EventBroadcasterConfig, EventList, EventSubscription, SubscribeError};
use sawtooth_executor::{ExecutorConfig, ProcessorRegistry, TransactionProcessor};
use sawtooth_journal::{
    BlockCache, BlockPublisher, BlockValidator, ChainController, ChainControllerConfig, Completer,
    CompleterConfig, GenesisController, GenesisError, InjectorRegistry, NullRequestSender,
    PublisherConfig, RequestSender,
};
use sawtooth_merkle::MerkleRadixTree;
use sawtooth_network::{AllowAllPermissions, NetworkConfig, NetworkService};
use sawtooth_scheduler::SchedulerKind;
use sawtooth_state::{ContextManager, SettingsView};
use sawtooth_types::{setting_keys, Address, Batch, Block, TransactionReceipt};
use std::{
    path::PathBuf,
    sync::Arc,
    thread::JoinHandle,
    time::Duration,
};
use thiserror::Error;
use tracing::{info, warn};

/// Installs the global tracing subscriber, filtered by `RUST_LOG`.
/// Subsequent calls are no-ops, so tests may call this freely.
pub fn init_logging() {
    let _ = tracing_subscriber::fmt()
        .with_env_filter(tracing_subscriber::EnvFilter::from_default_env())
        .try_init();
}

#[derive(Debug, Error)]
pub enum ValidatorError {
    #[error(transparent)]
    ChainStore(#[from] sawtooth_chain_store::ChainStoreError),
    #[error(transparent)]
    Genesis(#[from] GenesisError),
    #[error(transparent)]
    State(#[from] sawtooth_state::StateError),
    #[error("network error: {0}")]
    Network(String),
    #[error("{0}")]
    Config(String),
}

#[derive(Clone)]
pub struct ValidatorConfig {
    pub data_dir: PathBuf,
    pub scheduler_kind: SchedulerKind,
    pub validation_pool_size: usize,
    pub executor_config: ExecutorConfig,
    pub publisher_tick: Duration,
    pub completer_config: CompleterConfig,
    /// `None` runs without networking (single-node and test setups).
    pub network: Option<NetworkConfig>,
    /// Identity/signing key; generated when absent.
    pub identity: Option<PrivateKey>,
}

impl ValidatorConfig {
    pub fn new(data_dir: impl Into<PathBuf>) -> Self {
        Self {
            data_dir: data_dir.into(),
            scheduler_kind: SchedulerKind::Parallel,
            validation_pool_size: 2,
            executor_config: ExecutorConfig::default(),
            publisher_tick: Duration::from_millis(100),
            completer_config: CompleterConfig::default(),
            network: None,
            identity: None,
        }
    }
}

type ProcessorFactory = Box<dyn FnOnce(Arc<ContextManager>) -> Arc<dyn TransactionProcessor>>;

struct ProcessorSpec {
    family: String,
    version: String,
    namespaces: Vec<String>,
    max_occupancy: usize,
    timeout: Option<Duration>,
    factory: ProcessorFactory,
}

/// Builder that lets in-process transaction processors register before the
/// genesis path runs.
pub struct ValidatorBuilder {
    config: ValidatorConfig,
    processors: Vec<ProcessorSpec>,
}

impl ValidatorBuilder {
    pub fn new(config: ValidatorConfig) -> Self {
        Self {
            config,
            processors: Vec::new(),
        }
    }

    pub fn with_processor(
        mut self,
        family: &str,
        version: &str,
        namespaces: Vec<String>,
        max_occupancy: usize,
        timeout: Option<Duration>,
        factory: impl FnOnce(Arc<ContextManager>) -> Arc<dyn TransactionProcessor> + 'static,
    ) -> Self {
        self.processors.push(ProcessorSpec {
            family: family.to_string(),
            version: version.to_string(),
            namespaces,
            max_occupancy,
            timeout,
            factory: Box::new(factory),
        });
        self
    }

    pub fn build(self) -> Result<Validator, ValidatorError> {
        Validator::build(self.config, self.processors)
    }
}

pub struct Validator {
    store: Arc<ChainStore>,
    cache: Arc<BlockCache>,
    context_manager: Arc<ContextManager>,
    registry: Arc<ProcessorRegistry>,
    injectors: Arc<InjectorRegistry>,
    consensus: Arc<ConsensusEngine>,
    chain_controller: ChainController,
    publisher: Arc<BlockPublisher>,
    completer: Arc<Completer>,
    events: Arc<EventBroadcaster>,
    network: Option<Arc<NetworkService>>,
    network_runtime: Option<tokio::runtime::Runtime>,
    shutdown: Sender<()>,
    threads: Vec<JoinHandle<()>>,
}

impl Validator {
    fn build(
        config: ValidatorConfig,
        processors: Vec<ProcessorSpec>,
    ) -> Result<Self, ValidatorError> {
        let identity = config.identity.clone().unwrap_or_else(PrivateKey::generate);

        let store = Arc::new(ChainStore::open(&config.data_dir)?);
        let cache = Arc::new(BlockCache::new(store.clone(), 128));
        let context_manager = Arc::new(ContextManager::new(Arc::new(store.node_store())));

        let registry = Arc::new(ProcessorRegistry::new());
        for spec in processors {
            let processor = (spec.factory)(context_manager.clone());
            registry
                .register(
                    &spec.family,
                    &spec.version,
                    spec.namespaces,
                    spec.max_occupancy,
                    spec.timeout,
                    processor,
                )
                .map_err(|err| ValidatorError::Config(err.to_string()))?;
        }

        // Genesis runs before anything else can move the chain.
        let genesis = GenesisController::new(
            store.clone(),
            context_manager.clone(),
            registry.clone(),
            identity.clone(),
            config.executor_config.clone(),
        );
        if genesis.requires_genesis()? {
            genesis.run()?;
        }

        // The consensus engine is chosen by the on-chain settings of the
        // current head (dev-mode until a chain says otherwise).
        let consensus_registry = ConsensusRegistry::with_devmode();
        let consensus = match store.chain_head()? {
            Some(head) => {
                let state_root = head
                    .header()
                    .map_err(|err| ValidatorError::Config(err.to_string()))?
                    .state_root_hash;
                let settings =
                    SettingsView::new(context_manager.node_store(), &state_root)?;
                let name = settings.get_setting(setting_keys::CONSENSUS_ALGORITHM_NAME)?;
                let version = settings.get_setting(setting_keys::CONSENSUS_ALGORITHM_VERSION)?;
                consensus_registry.resolve(name.as_deref(), version.as_deref())
            }
            None => consensus_registry.resolve(None, None),
        };

        let validator = Arc::new(BlockValidator::new(
            context_manager.clone(),
            registry.clone(),
            consensus.clone(),
            config.scheduler_kind,
            config.executor_config.clone(),
        ));
        let chain_controller = ChainController::new(
            store.clone(),
            cache.clone(),
            validator,
            ChainControllerConfig {
                validation_pool_size: config.validation_pool_size,
                ..Default::default()
            },
        );

        let injectors = Arc::new(InjectorRegistry::new());
        let publisher = Arc::new(BlockPublisher::new(
            context_manager.clone(),
            registry.clone(),
            consensus.clone(),
            injectors.clone(),
            cache.clone(),
            identity.clone(),
            PublisherConfig {
                scheduler_kind: config.scheduler_kind,
                executor_config: config.executor_config.clone(),
                tick: config.publisher_tick,
            },
        ));
        chain_controller.set_chain_head_listener(publisher.clone());

        // Optional networking.
        let network = match &config.network {
            Some(network_config) => {
                let service = NetworkService::new(
                    network_config.clone(),
                    identity.clone(),
                    Arc::new(AllowAllPermissions),
                );
                Some(service)
            }
            None => None,
        };

        let request_sender: Arc<dyn RequestSender> = match &network {
            Some(service) => Arc::new(PeerRequestSender::new(service.clone())),
            None => Arc::new(NullRequestSender),
        };
        let completer = Arc::new(Completer::new(
            cache.clone(),
            Arc::new(chain_controller.clone()),
            publisher.clone(),
            request_sender,
            config.completer_config.clone(),
        ));

        // Published blocks go to the local journal and out to the network.
        publisher.set_broadcaster(Arc::new(BroadcastFanout::new(
            completer.clone(),
            network.clone(),
        )));
        if let Some(service) = &network {
            service.set_gossip_handler(Arc::new(GossipGlue::new(
                completer.clone(),
                store.clone(),
                cache.clone(),
            )));
        }

        let events = Arc::new(EventBroadcaster::new(
            store.clone(),
            EventBroadcasterConfig::default(),
        ));

        let (shutdown, _) = crossbeam_channel::bounded(0);
        Ok(Self {
            store,
            cache,
            context_manager,
            registry,
            injectors,
            consensus,
            chain_controller,
            publisher,
            completer,
            events,
            network,
            network_runtime: None,
            shutdown,
            threads: Vec::new(),
        })
    }

    /// Spawns the long-running loops: publisher, completer retries, event
    /// distribution, and (when configured) the network service.
    pub fn start(&mut self) -> Result<(), ValidatorError> {
        let (shutdown_tx, shutdown_rx) = crossbeam_channel::bounded::<()>(4);
        self.shutdown = shutdown_tx;

        let publisher = self.publisher.clone();
        let publisher_shutdown = shutdown_rx.clone();
        self.threads.push(
            std::thread::Builder::new()
                .name("block-publisher".to_string())
                .spawn(move || publisher.run(publisher_shutdown))
                .expect("spawn publisher thread"),
        );

        let completer = self.completer.clone();
        let completer_shutdown = shutdown_rx.clone();
        self.threads.push(
            std::thread::Builder::new()
                .name("completer".to_string())
                .spawn(move || loop {
                    match completer_shutdown.recv_timeout(Duration::from_millis(250)) {
                        Ok(()) | Err(crossbeam_channel::RecvTimeoutError::Disconnected) => break,
                        Err(crossbeam_channel::RecvTimeoutError::Timeout) => completer.tick(),
                    }
                })
                .expect("spawn completer thread"),
        );

        let observer = self.chain_controller.add_observer();
        let events = self.events.clone();
        let events_shutdown = shutdown_rx.clone();
        self.threads.push(
            std::thread::Builder::new()
                .name("event-broadcaster".to_string())
                .spawn(move || loop {
                    crossbeam_channel::select! {
                        recv(observer) -> event => match event {
                            Ok(event) => events.on_chain_event(&event),
                            Err(_) => break,
                        },
                        recv(events_shutdown) -> _ => break,
                    }
                })
                .expect("spawn event thread"),
        );

        if let Some(service) = self.network.clone() {
            let runtime = tokio::runtime::Builder::new_multi_thread()
                .enable_all()
                .thread_name("network")
                .build()
                .map_err(|err| ValidatorError::Network(err.to_string()))?;
            runtime
                .block_on(async { service.start().await })
                .map_err(|err| ValidatorError::Network(err.to_string()))?;
            // The service's tasks live on this runtime until shutdown.
            self.network_runtime = Some(runtime);
        }

        info!("validator started");
        Ok(())
    }

    pub fn stop(&mut self) {
        for _ in 0..self.threads.len() {
            let _ = self.shutdown.send(());
        }
        for handle in self.threads.drain(..) {
            if handle.join().is_err() {
                warn!("validator thread panicked during shutdown");
            }
        }
        if let Some(runtime) = self.network_runtime.take() {
            runtime.shutdown_background();
        }
        self.chain_controller.join();
    }

    /// Submits a client batch into the pipeline.
    pub fn submit_batch(&self, batch: Batch) {
        self.completer.on_batch_received(batch);
    }

    /// Hands a block received out-of-band to the pipeline.
    pub fn submit_block(&self, block: Block) {
        self.completer.on_block_received(block);
    }

    pub fn chain_head(&self) -> Result<Option<Block>, ValidatorError> {
        Ok(self.store.chain_head()?)
    }

    pub fn get_block(&self, block_id: &str) -> Result<Option<Block>, ValidatorError> {
        Ok(self.store.get_block(block_id)?)
    }

    pub fn get_batch(&self, batch_id: &str) -> Result<Option<Batch>, ValidatorError> {
        Ok(self.store.get_batch(batch_id)?)
    }

    pub fn get_receipt(
        &self,
        txn_id: &str,
    ) -> Result<Option<TransactionReceipt>, ValidatorError> {
        Ok(self.store.get_receipt(txn_id)?)
    }

    /// Reads a state entry at the current chain head.
    pub fn get_state(&self, address: &Address) -> Result<Option<Vec<u8>>, ValidatorError> {
        let Some(head) = self.store.chain_head()? else {
            return Ok(None);
        };
        let state_root = head
            .header()
            .map_err(|err| ValidatorError::Config(err.to_string()))?
            .state_root_hash;
        let tree = MerkleRadixTree::new(self.context_manager.node_store(), Some(&state_root))
            .map_err(sawtooth_state::StateError::from)?;
        Ok(tree.get(address).map_err(sawtooth_state::StateError::from)?)
    }

    pub fn subscribe_events(
        &self,
        subscriptions: &[EventSubscription],
        last_known_block_ids: &[String],
    ) -> Result<tokio::sync::mpsc::Receiver<EventList>, SubscribeError> {
        self.events.subscribe(subscriptions, last_known_block_ids)
    }

    pub fn store(&self) -> &Arc<ChainStore> {
        &self.store
    }

    pub fn context_manager(&self) -> &Arc<ContextManager> {
        &self.context_manager
    }

    pub fn processor_registry(&self) -> &Arc<ProcessorRegistry> {
        &self.registry
    }

    pub fn injector_registry(&self) -> &Arc<InjectorRegistry> {
        &self.injectors
    }

    pub fn consensus(&self) -> &Arc<ConsensusEngine> {
        &self.consensus
    }

    pub fn block_cache(&self) -> &Arc<BlockCache> {
        &self.cache
    }

    pub fn has_fatal_error(&self) -> bool {
        self.chain_controller.has_fatal_error()
    }
}
