mod change_event;

pub use change_event::BeanDelta;
pub use change_event::ChangeEvent;
pub use change_event::ChangeEventBuilder;
pub use change_event::ChangeKind;
pub use change_event::EmptyChangeEvent;
pub use change_event::TableMod;
