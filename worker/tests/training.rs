mod common;

use std::fs;

use comms::collective::{CollectiveErr, MemoryCollective};
use common::{
    RecordingLoader, Workspace, derived_steps, nz, run_fleet, spawn_worker, spawn_worker_with,
};
use machine_learning::{
    arch::{Classifier, Model},
    optimization::Sgd,
};
use tokio::task::JoinSet;
use worker::{
    Phase, Steps, Synchronizer, TrainingState, WorkerErr, checkpoint::CheckpointManager,
    data::Catalog,
};

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn fleet_trains_with_identical_weights_on_every_worker() {
    let ws = Workspace::new(8, 4);
    let cfg = ws.config(3);

    let reports: Vec<_> = run_fleet(&cfg, 3)
        .await
        .into_iter()
        .map(|outcome| outcome.unwrap().0)
        .collect();

    let coordinator = &reports[0];
    assert_eq!(coordinator.initial_epoch, 0);
    assert_eq!(coordinator.final_epoch, 3);
    assert_eq!(coordinator.history.len(), 3);

    for report in &reports[1..] {
        assert_eq!(report.model_parameters, coordinator.model_parameters);
        assert_eq!(report.history, coordinator.history);
    }

    for epoch in 1..=3 {
        assert!(ws.checkpoint(epoch).is_file());
    }

    let events = ws.events();
    assert_eq!(events.len(), 3);
    assert_eq!(events[2]["epoch"], 2);
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn rates_follow_the_schedule_of_the_fleet() {
    let ws = Workspace::new(4, 2);
    let cfg = ws.config(3);

    let (report, _) = run_fleet(&cfg, 2).await.remove(0).unwrap();
    let rates: Vec<f64> = report.history.iter().map(|e| e.lr).collect();

    // Warmup from 0.05 to 0.05 * 2, then halved from epoch 2.
    assert_eq!(rates[0], 0.05);
    assert!((rates[1] - 0.1).abs() < 1e-12);
    assert!((rates[2] - 0.05).abs() < 1e-12);
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn fresh_run_goes_from_zero_to_the_last_epoch() {
    let ws = Workspace::new(2, 1);
    let mut cfg = ws.config(90);
    cfg.decay_epochs = vec![30.0, 60.0, 80.0];
    cfg.decay_multipliers = vec![1.0, 0.1, 0.01, 0.001];

    for outcome in run_fleet(&cfg, 2).await {
        let (report, phase) = outcome.unwrap();
        assert_eq!(report.initial_epoch, 0);
        assert_eq!(report.final_epoch, 90);
        assert_eq!(report.history.len(), 90);
        assert_eq!(phase, Phase::Done);
    }
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn training_reduces_the_loss() {
    let ws = Workspace::new(8, 4);
    let cfg = ws.config(8);

    let (report, _) = run_fleet(&cfg, 2).await.remove(0).unwrap();
    let first = report.history.first().unwrap().metrics;
    let last = report.history.last().unwrap().metrics;

    assert!(last.loss < first.loss, "{first:?} -> {last:?}");
    assert!(last.val_loss < first.val_loss, "{first:?} -> {last:?}");
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn interrupted_run_resumes_from_the_latest_checkpoint() {
    let ws = Workspace::new(8, 4);

    let first: Vec<_> = run_fleet(&ws.config(2), 2)
        .await
        .into_iter()
        .map(|outcome| outcome.unwrap().0)
        .collect();
    assert_eq!(first[0].final_epoch, 2);

    let manager = CheckpointManager::new(ws.logs.path());
    let saved = manager.load(&ws.checkpoint(2)).unwrap();
    assert_eq!(saved.epoch, 2);
    assert_eq!(saved.model_parameters, first[0].model_parameters);

    let resumed: Vec<_> = run_fleet(&ws.config(4), 2)
        .await
        .into_iter()
        .map(|outcome| outcome.unwrap().0)
        .collect();

    for report in &resumed {
        assert_eq!(report.initial_epoch, 2);
        assert_eq!(report.final_epoch, 4);
        assert_eq!(report.history.len(), 2);
        assert_eq!(report.history[0].epoch, 2);
        assert_eq!(report.model_parameters, resumed[0].model_parameters);
    }

    assert!(ws.checkpoint(4).is_file());
    assert_eq!(ws.events().len(), 4);
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn every_validation_example_is_evaluated_once_per_epoch() {
    let ws = Workspace::new(4, 4);
    let cfg = ws.config(1);
    let steps = derived_steps(&cfg, 2);
    let loader = RecordingLoader::default();

    let handles: Vec<_> = MemoryCollective::fleet(nz(2))
        .into_iter()
        .map(|collective| spawn_worker_with(cfg.clone(), steps, collective, loader.clone()))
        .collect();

    for handle in handles {
        handle.await.unwrap().unwrap();
    }

    let val_dir = cfg.validation_dir();
    let expected: Vec<_> = Catalog::scan(&val_dir)
        .unwrap()
        .entries()
        .iter()
        .map(|e| e.path.clone())
        .collect();

    assert_eq!(expected.len(), 12);
    assert_eq!(loader.loaded_from(&val_dir), expected);
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn resuming_with_another_fleet_size_aborts_every_worker() {
    let ws = Workspace::new(4, 2);
    run_fleet(&ws.config(2), 1).await.remove(0).unwrap();

    let outcomes = run_fleet(&ws.config(4), 2).await;

    assert!(
        matches!(outcomes[0], Err(WorkerErr::Checkpoint { .. })),
        "{:?}",
        outcomes[0].as_ref().err()
    );
    assert!(
        matches!(
            outcomes[1],
            Err(WorkerErr::Collective(CollectiveErr::Aborted(_)))
        ),
        "{:?}",
        outcomes[1].as_ref().err()
    );

    assert!(!ws.checkpoint(3).exists());
    assert_eq!(ws.events().len(), 2);
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn resuming_with_another_base_rate_is_rejected() {
    let ws = Workspace::new(4, 2);
    run_fleet(&ws.config(1), 1).await.remove(0).unwrap();

    let mut cfg = ws.config(2);
    cfg.base_lr *= 2.0;

    let outcome = run_fleet(&cfg, 1).await.remove(0);
    assert!(matches!(outcome, Err(WorkerErr::Checkpoint { .. })));
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn failed_checkpoints_leave_no_event_behind() {
    let ws = Workspace::new(4, 2);
    // A directory in the way makes the final rename fail.
    fs::create_dir_all(ws.checkpoint(1)).unwrap();

    let outcome = run_fleet(&ws.config(1), 1).await.remove(0);
    assert!(matches!(outcome, Err(WorkerErr::Checkpoint { .. })));
    assert!(ws.events().is_empty());
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn finished_run_does_nothing_more() {
    let ws = Workspace::new(4, 2);
    run_fleet(&ws.config(1), 2).await;

    for outcome in run_fleet(&ws.config(1), 2).await {
        let (report, phase) = outcome.unwrap();
        assert_eq!(report.initial_epoch, 1);
        assert_eq!(report.final_epoch, 1);
        assert!(report.history.is_empty());
        assert_eq!(phase, Phase::Done);
    }
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn mismatched_step_counts_abort_the_fleet() {
    let ws = Workspace::new(8, 4);
    let cfg = ws.config(1);
    let steps = derived_steps(&cfg, 2);

    let mut fleet = MemoryCollective::fleet(nz(2));
    let lagging = fleet.pop().unwrap();
    let coordinator = fleet.pop().unwrap();

    let ahead = Steps {
        per_epoch: steps.per_epoch + 1,
        ..steps
    };

    let a = spawn_worker(cfg.clone(), ahead, coordinator);
    let b = spawn_worker(cfg, steps, lagging);

    for handle in [a, b] {
        let err = handle.await.unwrap().unwrap_err();
        assert!(
            matches!(err, WorkerErr::Collective(CollectiveErr::Desync { .. })),
            "{err}"
        );
    }
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn corrupt_examples_abort_training() {
    let ws = Workspace::new(4, 2);
    fs::write(ws.data.path().join("train/class0/not-a-number"), b"").unwrap();
    let mut cfg = ws.config(1);
    // More examples than a single pass, so the corrupt one is always drawn.
    cfg.steps_per_epoch = Some(nz(4));

    let outcome = run_fleet(&cfg, 1).await.remove(0);
    assert!(matches!(outcome, Err(WorkerErr::Decode { .. })));
}

#[tokio::test]
async fn broadcasting_an_identical_state_changes_nothing() {
    let model = Classifier::new(5, 3);
    let mut set = JoinSet::new();

    for collective in MemoryCollective::fleet(nz(3)) {
        let sgd = Sgd::new(model.size(), 0.1, 0.9, 0.0);
        let mut state = TrainingState::fresh(&model, sgd, 7).unwrap();
        state.optimizer.state_mut().fill(0.125);

        set.spawn(async move {
            let before = state.clone();
            let mut sync = Synchronizer::new(collective);
            sync.broadcast_state(&mut state, 0).await.unwrap();
            (before, state)
        });
    }

    while let Some(res) = set.join_next().await {
        let (before, after) = res.unwrap();
        let bits = |v: &[f32]| v.iter().map(|x| x.to_bits()).collect::<Vec<_>>();

        assert_eq!(bits(&before.model_parameters), bits(&after.model_parameters));
        assert_eq!(
            bits(before.optimizer_parameters()),
            bits(after.optimizer_parameters())
        );
    }
}

#[tokio::test]
async fn broadcast_state_overwrites_diverged_workers() {
    let model = Classifier::new(2, 2);
    let mut set = JoinSet::new();

    for (seed, collective) in MemoryCollective::fleet(nz(2)).into_iter().enumerate() {
        let sgd = Sgd::new(model.size(), 0.1, 0.9, 0.0);
        let mut state = TrainingState::fresh(&model, sgd, seed as u64).unwrap();

        set.spawn(async move {
            let mut sync = Synchronizer::new(collective);
            sync.broadcast_state(&mut state, 1).await.unwrap();
            state.model_parameters
        });
    }

    let expected = {
        let sgd = Sgd::new(model.size(), 0.1, 0.9, 0.0);
        TrainingState::fresh(&model, sgd, 1).unwrap().model_parameters
    };

    while let Some(res) = set.join_next().await {
        assert_eq!(res.unwrap(), expected);
    }
}
