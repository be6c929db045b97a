// Universal invariants (see the testable-properties section of the design
// notes this crate was built against): checked here end to end, through the
// public API, on a model that has actually been through a few EM iterations
// rather than on hand-built fixtures. Per-module unit tests already cover
// S1-S6 in isolation; this file is the cross-module capstone.

use seqmodel_core::{
    DiscountConfig, Emergence, Model, Sample, Sequitur, SizeConstraints, SymbolInventory,
    TrainingConfig, TrainingContext, Trainer,
};

const EPS: f64 = 1e-9;

fn trained_context() -> (TrainingContext, Vec<(usize, usize)>) {
    let mut left = SymbolInventory::new();
    let mut right = SymbolInventory::new();
    let a = left.index("a");
    let b = left.index("b");
    let cap_a = right.index("A");
    let cap_b = right.index("B");
    let sequitur = Sequitur::with_inventories(left, right);

    let samples = vec![
        Sample::new(vec![a, b], vec![cap_a]),
        Sample::new(vec![b, a], vec![cap_a]),
        Sample::new(vec![a, a], vec![cap_b]),
        Sample::new(vec![b, b], vec![cap_b]),
    ];

    let mut config = TrainingConfig::default();
    config.size_constraints = SizeConstraints::Explicit(vec![(1, 0), (2, 1)]);
    config.emergence = Emergence::Emerge;
    config.discount = DiscountConfig::Fixed(vec![0.0]);
    config.max_iterations = 4;
    config.min_iterations = 4;

    let templates = config.size_constraints.templates();
    let model = Model::oblivious(sequitur, &templates);
    let mut ctx = TrainingContext::new(model);
    let mut trainer = Trainer::new(config, samples.len(), 0).unwrap();
    trainer.run(&mut ctx, &samples, &[], || false, None, None).unwrap();
    (ctx, templates)
}

#[test]
fn invariant_1_direct_mass_never_exceeds_one() {
    let (ctx, _templates) = trained_context();
    let sm = &ctx.model.sequence_model;
    for state in 0..sm.num_nodes() as u32 {
        let total: f64 = sm.direct_entries(state).map(|(_, p)| p).sum();
        assert!(
            total <= 1.0 + EPS,
            "state {state} has direct mass {total}, which exceeds 1 + eps"
        );
    }
}

#[test]
fn invariant_2_back_off_weight_is_remaining_mass() {
    let (ctx, _templates) = trained_context();
    let sm = &ctx.model.sequence_model;
    for state in 0..sm.num_nodes() as u32 {
        let direct_mass: f64 = sm.direct_entries(state).map(|(_, p)| p).sum();
        let expected_bow = (1.0 - direct_mass).max(0.0);
        assert!(
            (sm.bow(state) - expected_bow).abs() < EPS,
            "state {state}: bow={} expected={}",
            sm.bow(state),
            expected_bow
        );
    }
}

#[test]
fn invariant_3_back_off_closure_integrates_to_one() {
    let (ctx, templates) = trained_context();
    let model = &ctx.model;
    let sm = &model.sequence_model;
    let vocabulary_size = model.sequitur.vocabulary_size(&templates);
    assert!(vocabulary_size > 0);

    for state in 0..sm.num_nodes() as u32 {
        let mut total = 0.0;
        for (id, _) in model.sequitur.inventory.iter() {
            total += sm.p(state, id);
        }
        assert!(
            (total - 1.0).abs() < 1e-6,
            "state {state}: closure over inventory sums to {total}, expected 1.0"
        );
    }
}

#[test]
fn invariant_8_index_is_monotone_within_a_run() {
    let mut left = SymbolInventory::new();
    let a1 = left.index("a");
    let a2 = left.index("a");
    let b = left.index("b");
    assert_eq!(a1, a2, "repeated index() calls for the same symbol must return the same id");
    assert_ne!(a1, b);
}

#[test]
fn invariant_6_checkpoint_round_trip_is_semantically_equal() {
    let (ctx, _templates) = trained_context();
    let dir = std::env::temp_dir().join(format!("seqmodel-core-invariants-{}", std::process::id()));
    std::fs::create_dir_all(&dir).unwrap();
    let path = dir.join("ckpt.bin");

    ctx.save(&path).unwrap();
    let restored = TrainingContext::load(&path).unwrap();

    assert_eq!(restored.iteration, ctx.iteration);
    let orig = ctx.model.sequence_model.get();
    let back = restored.model.sequence_model.get();
    assert_eq!(orig.len(), back.len());
    for ((h1, t1, s1), (h2, t2, s2)) in orig.iter().zip(back.iter()) {
        assert_eq!(h1, h2);
        assert_eq!(t1, t2);
        assert!((s1 - s2).abs() < 1e-12, "score drifted across round trip: {s1} vs {s2}");
    }
}
