use std::sync::Arc;

use crate::buffer_pool::BufferPool;
use crate::config::RemoteConfig;
use crate::message_dispatcher::DispatchHandle;
use crate::message_registry::MessageRegistry;

/// Immutable wiring shared by every session and listener of one application:
///  the frozen message registry, the configuration, the buffer pool and the
///  enqueue side of the message dispatcher.
pub struct RemoteContext {
    config: RemoteConfig,
    registry: MessageRegistry,
    buffer_pool: Arc<BufferPool>,
    dispatcher: DispatchHandle,
}

impl RemoteContext {
    pub fn new(
        config: RemoteConfig,
        registry: MessageRegistry,
        dispatcher: DispatchHandle,
    ) -> anyhow::Result<Arc<RemoteContext>> {
        config.validate()?;

        let buffer_pool = Arc::new(BufferPool::new(config.buffer_pool_chunk_size, config.buffer_pool_size));
        Ok(Arc::new(RemoteContext {
            config,
            registry,
            buffer_pool,
            dispatcher,
        }))
    }

    pub fn config(&self) -> &RemoteConfig {
        &self.config
    }

    pub fn registry(&self) -> &MessageRegistry {
        &self.registry
    }

    pub fn buffer_pool(&self) -> &Arc<BufferPool> {
        &self.buffer_pool
    }

    pub(crate) fn dispatcher(&self) -> &DispatchHandle {
        &self.dispatcher
    }
}
