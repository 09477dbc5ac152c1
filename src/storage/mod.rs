pub mod event;
pub mod event_store;
pub mod index;
pub mod primary;
pub mod properties;
pub mod scheduler;
pub mod secondary;
pub mod segment;
pub mod synchronizer;
pub mod tier;
pub mod write_position;

pub use event::{
    Event, EventInformation, EventType, EventTypeContext, EventWithToken, ProcessedEvent,
    SerializedObject, TransactionWithToken,
};
pub use event_store::EventStore;
pub use index::{IndexManager, PositionInfo};
pub use primary::{PrimaryEventStore, PreparedTransaction, SequenceReservation};
pub use properties::StorageProperties;
pub use secondary::SecondaryEventStore;
pub use segment::{EventSource, ReadOnlySegment, SegmentView, WritableSegment};
pub use synchronizer::StorageCallback;
pub use tier::{EventStream, SegmentTier, TransactionStream};
pub use write_position::{WritePosition, WritePositionRef};
