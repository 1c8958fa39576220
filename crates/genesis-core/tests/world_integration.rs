use std::sync::Arc;

use genesis_core::{GenesisConfig, ParamChange, TraitRegistry, WorldState};

fn test_config() -> GenesisConfig {
    GenesisConfig {
        world_width: 600.0,
        world_height: 600.0,
        min_population: 8,
        max_entities: 60,
        initial_resources: 40,
        resource_spawn_rate: 2.0,
        rng_seed: Some(0xDEAD_BEEF),
        snapshot_interval: 25,
        ..GenesisConfig::default()
    }
}

#[test]
fn population_stays_within_bounds_over_many_ticks() {
    let mut world = WorldState::new(test_config()).expect("world");
    for _ in 0..400 {
        let report = world.step();
        let alive = world.alive_count();
        assert!(alive <= world.config().max_entities, "alive={alive}");
        // The floor is restored in the same tick it is breached.
        assert!(
            alive >= world.config().min_population,
            "tick={} alive={alive}",
            report.tick.0
        );
    }
}

#[test]
fn snapshot_ticks_are_strictly_increasing() {
    let mut world = WorldState::new(test_config()).expect("world");
    let mut snapshot_ticks = Vec::new();
    for _ in 0..120 {
        let report = world.step();
        if report.snapshot_due {
            snapshot_ticks.push(world.collect_snapshot(0.0).tick);
        }
    }
    assert!(!snapshot_ticks.is_empty());
    assert!(snapshot_ticks.windows(2).all(|w| w[0] < w[1]));
}

#[test]
fn active_traits_stay_a_subset_of_the_registry() {
    let registry = Arc::new(TraitRegistry::new());
    let mut world = WorldState::with_registry(test_config(), registry.clone()).expect("world");

    let boost = Arc::new(
        genesis_script::compile("trait Boost { fn execute(entity) { entity.energy += 1; } }")
            .expect("compile"),
    );
    registry.install("Boost", boost, 1);

    let drift = Arc::new(
        genesis_script::compile(
            "use random;\ntrait Drift { fn execute(entity) { entity.move(random::range(-2.0, 2.0), random::range(-2.0, 2.0)); } }",
        )
        .expect("compile"),
    );
    registry.install("Drift", drift, 1);

    for _ in 0..60 {
        world.step();
        let names = registry.names();
        for view in world.entity_views() {
            for name in &view.traits {
                assert!(names.contains(name), "unregistered trait {name}");
            }
        }
    }
}

#[test]
fn trait_versions_replace_atomically_under_stepping() {
    let registry = Arc::new(TraitRegistry::new());
    let mut world = WorldState::with_registry(test_config(), registry.clone()).expect("world");

    let v1 = Arc::new(
        genesis_script::compile("trait Boost { fn execute(entity) { entity.energy += 1; } }")
            .expect("compile v1"),
    );
    registry.install("Boost", v1, 1);
    for _ in 0..10 {
        world.step();
    }

    let v2 = Arc::new(
        genesis_script::compile("trait Boost { fn execute(entity) { entity.energy += 2; } }")
            .expect("compile v2"),
    );
    let registry_version = registry.install("Boost", v2, 2);
    assert_eq!(registry_version, 2);
    assert_eq!(registry.active_version("Boost"), Some(2));
    // One name, one active version: the map never holds both.
    assert_eq!(registry.snapshot().len(), 1);

    for _ in 0..10 {
        world.step();
    }
    assert!(world.alive_count() >= world.config().min_population);
}

#[test]
fn parameter_updates_take_effect_and_keep_invariants() {
    let mut world = WorldState::new(test_config()).expect("world");
    for _ in 0..20 {
        world.step();
    }

    world.queue_param(ParamChange::MinPopulation(15));
    world.queue_param(ParamChange::SpawnRate(0.0));
    let report = world.step();
    assert_eq!(report.applied_params.len(), 2);
    assert_eq!(world.config().min_population, 15);

    for _ in 0..20 {
        world.step();
        assert!(world.alive_count() >= 15);
    }
}

#[test]
fn regression_seeded_run_matches_itself() {
    let run = |ticks: u32| {
        let mut world = WorldState::new(test_config()).expect("world");
        for _ in 0..ticks {
            world.step();
        }
        let views = world.entity_views();
        (
            world.tick().0,
            views.len(),
            views.iter().map(|v| v.handle).collect::<Vec<_>>(),
            views.iter().map(|v| (v.x, v.y)).collect::<Vec<_>>(),
        )
    };
    assert_eq!(run(100), run(100));
}
