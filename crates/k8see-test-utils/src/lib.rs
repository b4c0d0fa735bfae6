// k8see-test-utils: Shared test doubles for the importer.
//
// Provides an in-memory consumer-group stream and an in-memory event store so
// the import engine, supervisor and purger can be exercised without Redis or
// PostgreSQL.

pub mod memory_sink;
pub mod memory_stream;

pub use memory_sink::MemorySink;
pub use memory_stream::MemoryStream;

use k8see_event::Fields;

/// Build a field map from string pairs.
pub fn fields(pairs: &[(&str, &str)]) -> Fields {
    pairs
        .iter()
        .map(|(k, v)| ((*k).to_owned(), v.as_bytes().to_vec()))
        .collect()
}

/// A complete, valid event with every timestamp set to `time`.
pub fn event_fields(name: &str, time: &str) -> Fields {
    fields(&[
        ("eventTime", time),
        ("firstTime", time),
        ("exportedTime", time),
        ("name", name),
        ("reason", "Scheduled"),
        ("type", "Normal"),
        ("message", "assigned to node-1"),
        ("namespace", "default"),
    ])
}
