use uuid::Uuid;

/// Produces identifiers for newly stored records.
pub trait IdGenerator: Send + Sync + std::fmt::Debug {
    fn next_id(&self) -> String;
}

/// Random v4 UUIDs rendered in their hyphenated form.
#[derive(Debug, Clone, Copy, Default)]
pub struct UuidGenerator;

impl IdGenerator for UuidGenerator {
    fn next_id(&self) -> String {
        Uuid::new_v4().to_string()
    }
}
