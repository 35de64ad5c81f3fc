use std::sync::Arc;

use polycore::composed::MatchSpec;
use polycore::config::{FederationConfig, MatchConfig};
use polycore::schema::{FieldRegistry, FieldType, Schemas};
use polycore::searcher::memory::{Document, MemoryCore};
use polycore::searcher::FederatedSearcher;

pub type Result<T, E = anyhow::Error> = std::result::Result<T, E>;

/// Installs the test subscriber once; `RUST_LOG` narrows the output.
pub fn init_tracing() {
    let _ = tracing_subscriber::fmt()
        .with_env_filter(tracing_subscriber::EnvFilter::from_default_env())
        .with_test_writer()
        .try_init();
}

const TITLES: [&str; 10] = [
    "zero", "one", "two", "three", "four", "five", "six", "seven", "eight", "nine",
];

pub fn schemas() -> Arc<Schemas> {
    let mut main = FieldRegistry::new();
    main.register("age", FieldType::Long);

    let mut main2 = FieldRegistry::new();
    main2.register("date", FieldType::Long);

    let mut schemas = Schemas::new();
    schemas.insert("main", main);
    schemas.insert("main2", main2);
    Arc::new(schemas)
}

/// Ten docs in `main`. Join keys `K0..K9`, `untokenized.field2` cycles
/// `value0..value2`, dedup groups `D0..D4` of two docs each.
pub fn main_core(schemas: &Schemas) -> MemoryCore {
    let mut core = MemoryCore::new("main", schemas.registry("main").unwrap().clone());
    for i in 0..10usize {
        core.add(
            Document::new(&format!("main:{i}"))
                .field("__key__.field", serde_json::json!(format!("K{i}")))
                .field("__key__.dedup", serde_json::json!(format!("D{}", i / 2)))
                .field(
                    "title",
                    serde_json::json!(format!("{} record", TITLES[i])),
                )
                .field(
                    "untokenized.field2",
                    serde_json::json!(format!("value{}", i % 3)),
                )
                .field("age", serde_json::json!(i)),
        );
    }
    core
}

/// Eight docs in `main2` joined to `K0..K7`: the first four are `red` with
/// dates 100..97, the rest `blue` with dates 96..93.
pub fn main2_core(schemas: &Schemas) -> MemoryCore {
    let mut core = MemoryCore::new("main2", schemas.registry("main2").unwrap().clone());
    for i in 0..8usize {
        core.add(
            Document::new(&format!("main2:{i}"))
                .field("__key__.field", serde_json::json!(format!("K{i}")))
                .field(
                    "untokenized.field3",
                    serde_json::json!(if i < 4 { "red" } else { "blue" }),
                )
                .field("date", serde_json::json!(100 - i as i64)),
        );
    }
    core
}

pub fn searcher() -> FederatedSearcher {
    init_tracing();
    let schemas = schemas();
    let mut searcher = FederatedSearcher::new(schemas.clone());
    searcher.register(Arc::new(main_core(&schemas)));
    searcher.register(Arc::new(main2_core(&schemas)));
    searcher
}

pub fn config() -> FederationConfig {
    let mut config = FederationConfig::new("main");
    config.matches.push(MatchConfig {
        a: MatchSpec::unique_key("main", "__key__.field"),
        b: MatchSpec::key("main2", "__key__.field"),
    });
    config
}
