use admeasure_core::{normalize, to_local_path};
use proptest::prelude::*;

fn canonical_id() -> impl Strategy<Value = String> {
    (
        prop::sample::select(vec!["eval", "prime", "consent-test"]),
        2020u32..2030,
        1u32..13,
        1u32..29,
        0u32..24,
        0u32..60,
        0u32..60,
        0u32..1000,
        "[a-z0-9-]{1,12}",
        0u32..20,
    )
        .prop_map(
            |(campaign, year, month, day, hour, minute, second, millis, site, step)| {
                format!(
                    "{campaign}/{year}-{month:02}-{day:02}T{hour:02}:{minute:02}:{second:02}.{millis:03}Z/{site}/measure-{step}"
                )
            },
        )
}

proptest! {
    #[test]
    fn normalize_is_idempotent(raw in r"[a-zT0-9/\\.:Z-]{0,40}(\.json)?") {
        let once = normalize(&raw);
        let twice = normalize(once.as_str());
        prop_assert_eq!(once, twice);
    }

    #[test]
    fn normalized_ids_have_no_edge_slashes(raw in r"[a-z0-9/\\.-]{0,40}") {
        let id = normalize(&raw);
        prop_assert!(!id.as_str().starts_with('/'));
        prop_assert!(!id.as_str().ends_with('/'));
        prop_assert!(!id.as_str().contains('\\'));
    }

    #[test]
    fn local_paths_have_no_colons(raw in r"[a-zT0-9/:.Z-]{0,40}") {
        prop_assert!(!to_local_path(&raw).contains(':'));
    }

    #[test]
    fn local_path_round_trips_for_timestamped_ids(id in canonical_id()) {
        let local = to_local_path(&id);
        let normalized = normalize(&local);
        prop_assert_eq!(normalized.as_str(), id.as_str());
    }

    #[test]
    fn artifact_keys_normalize_to_their_step(id in canonical_id()) {
        for file in ["console.json", "measure.json", "plan.json"] {
            let key = format!("{id}/{file}");
            let normalized = normalize(&key);
            prop_assert_eq!(normalized.as_str(), id.as_str());
            let windows = format!("{}\\{file}", to_local_path(&id).replace('/', "\\"));
            let normalized = normalize(&windows);
            prop_assert_eq!(normalized.as_str(), id.as_str());
        }
    }
}
