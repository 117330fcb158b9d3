use std::{sync::Arc, time::Duration};

use tokio::time::{sleep, Instant};

use swarmnet_core::{hash::question_hash, RoundStage, StageZeroOutput, TimedOutput};

use super::utils::{
    enable_logging,
    local_coordinator,
    orchestrator,
    orchestrator_with_dataset,
    settings,
    stages,
    store,
    RecordingTrainer,
};
use crate::{
    coordinator::{CoordinatorError, MockSwarmCoordinator},
    merge::{merge_stage, MergeError},
    settings::CounterSource,
    state_machine::{OrchestratorError, PeerState, Role, TrainingError},
};

#[tokio::test(start_paused = true)]
async fn integration_follower_joins_in_the_middle_of_a_round() {
    enable_logging();
    let mut store = store();
    let service = local_coordinator(&store);

    // another peer already finished stage 0 of round 2
    let rs = RoundStage::new(2, 0);
    let output = TimedOutput::new(
        store.now(),
        StageZeroOutput {
            question: "What is 12 plus 30?".into(),
            answer: "42".into(),
            agent_answers: vec![(
                "early".to_string(),
                "<think>\n12 and 30\n</think>\n<answer>\n42\n</answer>\n".to_string(),
            )]
            .into_iter()
            .collect(),
        },
    );
    store.publish_output("early", rs, &output).await.unwrap();
    store.publish_reward(rs, "early", 1.5).await.unwrap();
    store
        .publish_round_and_stage(RoundStage::new(2, 1))
        .await
        .unwrap();

    let trainer = RecordingTrainer::new("follower");
    let seen = trainer.seen();
    let mut follower = orchestrator(
        "follower",
        Role::Follower,
        &store,
        trainer,
        service,
        settings(3),
    );
    follower.run().await.unwrap();

    assert_eq!(*seen.lock().unwrap(), stages(2, &[1, 2]));
    assert_eq!(follower.peer().state(), PeerState::Done);

    // the stage 1 output of the follower builds on the stage 0 answer of the early peer
    let stage1 = store
        .outputs("follower", RoundStage::new(2, 1))
        .await
        .unwrap()
        .unwrap();
    let stage1 = &stage1[&question_hash("What is 12 plus 30?")].output;
    assert!(stage1.prompt().unwrap().contains("42"));

    let merged = merge_stage(&mut store, "other", None, RoundStage::new(2, 2))
        .await
        .unwrap();
    assert_eq!(merged.len(), 1);
    let contribution = merged[0].contribution("follower").unwrap();
    assert_ne!(contribution, merged[0].sentinel());
    assert!(contribution.contains("<majority>"));
}

#[tokio::test(start_paused = true)]
async fn integration_follower_recovers_a_round_without_previous_stage() {
    enable_logging();
    let mut store = store();
    store
        .publish_round_and_stage(RoundStage::new(1, 1))
        .await
        .unwrap();

    let trainer = RecordingTrainer::new("follower");
    let seen = trainer.seen();
    let mut follower = orchestrator(
        "follower",
        Role::Follower,
        &store,
        trainer,
        local_coordinator(&store),
        settings(2),
    );
    follower.run().await.unwrap();

    assert_eq!(*seen.lock().unwrap(), stages(1, &[0, 1, 2]));
    assert_eq!(
        store.participants(RoundStage::new(1, 0)).await.unwrap(),
        Some(vec!["follower".to_string()])
    );
}

#[tokio::test(start_paused = true)]
async fn integration_follower_fails_without_participants() {
    enable_logging();
    let mut store = store();
    store
        .publish_round_and_stage(RoundStage::new(0, 0))
        .await
        .unwrap();

    let trainer = RecordingTrainer::new("follower");
    let seen = trainer.seen();
    let mut follower = orchestrator_with_dataset(
        "follower",
        Role::Follower,
        &store,
        trainer,
        local_coordinator(&store),
        settings(1),
        Vec::new(),
    );

    // nothing is published for stage 0, so stage 1 has nobody to merge
    assert!(matches!(
        follower.run().await,
        Err(OrchestratorError::Merge(MergeError::MissingParticipants(_)))
    ));
    assert_eq!(*seen.lock().unwrap(), stages(0, &[0]));
    assert_ne!(follower.peer().state(), PeerState::Done);
}

#[tokio::test(start_paused = true)]
async fn integration_follower_retries_transient_failures() {
    enable_logging();
    let mut store = store();
    store
        .publish_round_and_stage(RoundStage::new(0, 0))
        .await
        .unwrap();

    let trainer = RecordingTrainer::new("follower").failing(2);
    let seen = trainer.seen();
    let cleanups = trainer.cleanups();
    let mut follower = orchestrator(
        "follower",
        Role::Follower,
        &store,
        trainer,
        local_coordinator(&store),
        settings(1),
    );
    let start = Instant::now();
    follower.run().await.unwrap();

    assert_eq!(
        *seen.lock().unwrap(),
        stages(0, &[0, 0, 0, 1, 2])
    );
    // after each failure and at the end of the round
    assert_eq!(cleanups.load(std::sync::atomic::Ordering::SeqCst), 3);
    assert!(start.elapsed() >= Duration::from_secs(10));

    // the failed attempts do not count towards the reward
    let rewards = store
        .rewards(RoundStage::new(0, 0))
        .await
        .unwrap()
        .unwrap();
    assert!(rewards["follower"] > 4. && rewards["follower"] < 5.);
}

#[tokio::test(start_paused = true)]
async fn integration_follower_gives_up_after_max_train_fails() {
    enable_logging();
    let mut store = store();
    store
        .publish_round_and_stage(RoundStage::new(0, 0))
        .await
        .unwrap();

    let trainer = RecordingTrainer::new("follower").failing(3);
    let seen = trainer.seen();
    let mut follower = orchestrator(
        "follower",
        Role::Follower,
        &store,
        trainer,
        local_coordinator(&store),
        settings(1),
    );

    assert!(matches!(
        follower.run().await,
        Err(OrchestratorError::Training(TrainingError::Transport(_)))
    ));
    assert_eq!(*seen.lock().unwrap(), stages(0, &[0, 0, 0]));
}

#[tokio::test(start_paused = true)]
async fn integration_follower_waits_for_the_counter() {
    enable_logging();
    let store = store();

    let trainer = RecordingTrainer::new("follower");
    let seen = trainer.seen();
    let mut follower = orchestrator(
        "follower",
        Role::Follower,
        &store,
        trainer,
        local_coordinator(&store),
        settings(1),
    );

    let mut publisher = store.clone();
    let start = Instant::now();
    let publish = async move {
        sleep(Duration::from_secs(60)).await;
        publisher
            .publish_round_and_stage(RoundStage::new(0, 0))
            .await
            .unwrap();
    };
    let (result, _) = tokio::join!(follower.run(), publish);
    result.unwrap();

    assert!(start.elapsed() >= Duration::from_secs(60));
    assert_eq!(*seen.lock().unwrap(), stages(0, &[0, 1, 2]));
}

#[tokio::test(start_paused = true)]
async fn integration_follower_follows_the_coordinator_service() {
    enable_logging();
    let store = store();

    let mut service = MockSwarmCoordinator::new();
    service
        .expect_register_peer()
        .times(1)
        .returning(|_| Ok(()));
    let mut calls = 0;
    service.expect_get_round_and_stage().returning(move || {
        calls += 1;
        if calls == 1 {
            Err(CoordinatorError::NoRoundAndStage)
        } else {
            Ok(RoundStage::new(0, 0))
        }
    });
    service.expect_submit_winners().never();

    let mut settings = settings(1);
    settings.training.follow = CounterSource::Coordinator;

    let trainer = RecordingTrainer::new("follower");
    let seen = trainer.seen();
    let mut follower = orchestrator(
        "follower",
        Role::Follower,
        &store,
        trainer,
        Arc::new(service),
        settings,
    );
    follower.run().await.unwrap();

    assert_eq!(*seen.lock().unwrap(), stages(0, &[0, 1, 2]));
}

#[tokio::test(start_paused = true)]
async fn integration_follower_ignores_lagging_rounds() {
    enable_logging();
    let store = store();

    let mut service = MockSwarmCoordinator::new();
    service
        .expect_register_peer()
        .times(1)
        .returning(|_| Ok(()));
    let mut calls = 0;
    service.expect_get_round_and_stage().returning(move || {
        calls += 1;
        match calls {
            1 => Ok(RoundStage::new(1, 0)),
            // a replica that has not caught up yet
            2 | 3 => Ok(RoundStage::new(0, 2)),
            _ => Ok(RoundStage::new(2, 0)),
        }
    });
    service.expect_submit_winners().never();

    let mut settings = settings(3);
    settings.training.follow = CounterSource::Coordinator;

    let trainer = RecordingTrainer::new("follower");
    let seen = trainer.seen();
    let mut follower = orchestrator(
        "follower",
        Role::Follower,
        &store,
        trainer,
        Arc::new(service),
        settings,
    );
    follower.run().await.unwrap();

    let mut expected = stages(1, &[0, 1, 2]);
    expected.extend(stages(2, &[0, 1, 2]));
    assert_eq!(*seen.lock().unwrap(), expected);
}

#[tokio::test(start_paused = true)]
async fn integration_training_times_out() {
    enable_logging();
    let mut store = store();
    store
        .publish_round_and_stage(RoundStage::new(0, 0))
        .await
        .unwrap();

    let mut settings = settings(1);
    settings.training.train_timeout = 600;

    let trainer = RecordingTrainer::new("follower").slow(Duration::from_secs(3600));
    let seen = trainer.seen();
    let mut follower = orchestrator(
        "follower",
        Role::Follower,
        &store,
        trainer,
        local_coordinator(&store),
        settings,
    );
    let start = Instant::now();
    follower.run().await.unwrap();

    assert!(start.elapsed() >= Duration::from_secs(600));
    assert_eq!(*seen.lock().unwrap(), stages(0, &[0]));
    assert_eq!(follower.peer().state(), PeerState::Done);
}
