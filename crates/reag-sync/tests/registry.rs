use std::path::Path;

use reag_adapters::{Acquisition, BUILTIN_SOURCES};
use reag_sync::SourceRegistry;

fn workspace_root() -> std::path::PathBuf {
    Path::new(env!("CARGO_MANIFEST_DIR"))
        .join("../..")
        .canonicalize()
        .unwrap()
}

#[tokio::test]
async fn checked_in_registry_resolves_every_builtin_source() {
    let registry = SourceRegistry::load(&workspace_root()).await.unwrap();
    let resolved = registry.resolve();

    assert!(resolved.unresolved.is_empty());
    let ids: Vec<_> = resolved.adapters.iter().map(|a| a.source_id().to_string()).collect();
    assert_eq!(ids, BUILTIN_SOURCES);

    let magicbricks = &resolved.adapters[0];
    assert_eq!(magicbricks.acquisition(), Acquisition::Streaming);
    assert!(magicbricks.listing_targets("Navi Mumbai")[0].url.contains("navi-mumbai"));
}
