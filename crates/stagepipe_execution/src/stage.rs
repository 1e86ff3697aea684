use std::fmt;
use std::marker::PhantomData;

use stagepipe_error::{Result, StagepipeError};

use crate::container::adaptor::StageAdaptor;
use crate::packet::{PacketPayload, PacketType};

/// Operator body executed for packets of a single payload type.
///
/// A new stage instance is created for every run of a packet list.
pub trait Stage: Default + Send + 'static {
    type Packet: PacketPayload;

    /// Name of the stage, used for worker thread names and logging.
    const NAME: &'static str;

    /// Whether the stage produces the same tuples in the same order every
    /// time it runs with the same payload.
    ///
    /// Replayable stages keep accepting packets while producing output, and
    /// late packets get the tuples they missed from a second run.
    const REPLAYABLE: bool = false;

    /// Run the operator, pulling input through the adaptor and pushing
    /// tuples to it.
    fn process(&mut self, adaptor: &mut StageAdaptor, packet: &Self::Packet) -> Result<()>;
}

/// Object safe form of a stage.
pub(crate) trait ErasedStage: Send {
    fn process_erased(&mut self, adaptor: &mut StageAdaptor, payload: &dyn PacketPayload)
        -> Result<()>;
}

impl<S: Stage> ErasedStage for S {
    fn process_erased(
        &mut self,
        adaptor: &mut StageAdaptor,
        payload: &dyn PacketPayload,
    ) -> Result<()> {
        let packet = payload
            .as_any()
            .downcast_ref::<S::Packet>()
            .ok_or_else(|| {
                StagepipeError::new(format!(
                    "Stage '{}' received payload of unexpected type: {payload:?}",
                    S::NAME
                ))
            })?;
        self.process(adaptor, packet)
    }
}

/// Creates stage instances for a container.
pub(crate) trait StageFactory: fmt::Debug + Send + Sync {
    fn name(&self) -> &'static str;

    fn packet_type(&self) -> PacketType;

    fn is_replayable(&self) -> bool;

    fn create(&self) -> Box<dyn ErasedStage>;
}

pub(crate) struct TypedStageFactory<S> {
    _stage: PhantomData<fn() -> S>,
}

impl<S: Stage> TypedStageFactory<S> {
    pub(crate) fn new() -> Self {
        TypedStageFactory {
            _stage: PhantomData,
        }
    }
}

impl<S: Stage> StageFactory for TypedStageFactory<S> {
    fn name(&self) -> &'static str {
        S::NAME
    }

    fn packet_type(&self) -> PacketType {
        PacketType::of::<S::Packet>()
    }

    fn is_replayable(&self) -> bool {
        S::REPLAYABLE
    }

    fn create(&self) -> Box<dyn ErasedStage> {
        Box::new(S::default())
    }
}

impl<S: Stage> fmt::Debug for TypedStageFactory<S> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("TypedStageFactory")
            .field("stage", &S::NAME)
            .finish()
    }
}
