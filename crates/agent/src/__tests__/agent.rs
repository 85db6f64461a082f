//! Agent lifecycle, shutdown and fault tests.

#[cfg(test)]
mod tests {
  use std::{
    sync::{
      Arc,
      atomic::{AtomicUsize, Ordering},
    },
    time::Duration,
  };

  use pretty_assertions::assert_eq;
  use tokio::sync::broadcast::error::TryRecvError;
  use tokio_util::sync::CancellationToken;

  use crate::{
    __tests__::helpers::{Probe, RecordingHandler, TEST_TIMEOUT, TestMessage, wait_for, within},
    Agent, AgentError, AgentOptions, AgentState, AskError, Capacity, FaultStage, MailboxError,
  };

  fn spawn_agent(probe: &Probe) -> Agent<TestMessage> {
    Agent::spawn(RecordingHandler::new(probe), AgentOptions::new("test")).expect("spawn agent")
  }

  fn counter() -> (Arc<AtomicUsize>, impl FnOnce() + Send + 'static) {
    let count = Arc::new(AtomicUsize::new(0));
    let hook = {
      let count = Arc::clone(&count);
      move || {
        count.fetch_add(1, Ordering::SeqCst);
      }
    };
    (count, hook)
  }

  // ==========================================================================
  // Ordering and draining
  // ==========================================================================

  #[tokio::test]
  async fn test_messages_posted_before_start_are_handled_in_order() {
    let probe = Probe::default();
    let agent = Agent::new(RecordingHandler::new(&probe), AgentOptions::new("queued"));
    assert_eq!(agent.state(), AgentState::NotStarted);

    for value in [1, 2, 3] {
      agent.post(TestMessage::Record(value)).await.expect("post");
    }
    assert_eq!(agent.queue_len(), 3);

    agent.start().expect("start");
    within(agent.stop(false, None)).await.expect("stop");

    assert_eq!(probe.seen(), vec![1, 2, 3]);
    assert_eq!(agent.state(), AgentState::Stopped);
  }

  #[tokio::test]
  async fn test_full_mailbox_suspends_producer_until_start() {
    let probe = Probe::default();
    let agent = Arc::new(Agent::new(
      RecordingHandler::new(&probe),
      AgentOptions::new("bounded").with_capacity(Capacity::Bounded(2)),
    ));

    let producer = tokio::spawn({
      let agent = Arc::clone(&agent);
      async move {
        for value in [1, 2, 3] {
          agent.post(TestMessage::Record(value)).await?;
        }
        Ok::<_, MailboxError>(())
      }
    });

    tokio::time::sleep(Duration::from_millis(20)).await;
    assert!(!producer.is_finished(), "third post should wait for space");
    assert!(agent.queue_len() >= 2);

    agent.start().expect("start");
    within(producer).await.expect("producer task").expect("posts");
    within(agent.stop(false, None)).await.expect("stop");

    assert_eq!(probe.seen(), vec![1, 2, 3]);
  }

  #[tokio::test]
  async fn test_graceful_stop_processes_every_accepted_message() {
    let probe = Probe::default();
    let agent = spawn_agent(&probe);

    for value in 0..50 {
      agent.post(TestMessage::Record(value)).await.expect("post");
    }
    within(agent.stop(false, None)).await.expect("stop");

    assert_eq!(probe.seen(), (0..50).collect::<Vec<_>>());
    assert_eq!(probe.events(), vec!["start", "end"]);
    assert_eq!(agent.post(TestMessage::Record(99)).await, Err(MailboxError::Closed));
  }

  #[tokio::test]
  async fn test_concurrent_producers_are_all_delivered() {
    let probe = Probe::default();
    let agent = Arc::new(Agent::spawn(
      RecordingHandler::new(&probe),
      AgentOptions::new("busy").with_capacity(Capacity::Bounded(4)),
    )
    .expect("spawn agent"));

    let producers: Vec<_> = (0..8u32)
      .map(|producer| {
        let agent = Arc::clone(&agent);
        tokio::spawn(async move {
          for i in 0..100 {
            agent.post(TestMessage::Record(producer * 1000 + i)).await.expect("post");
          }
        })
      })
      .collect();

    for producer in producers {
      within(producer).await.expect("producer task");
    }
    within(agent.stop(false, None)).await.expect("stop");

    let mut seen = probe.seen();
    assert_eq!(seen.len(), 800);

    // Per-producer order is preserved
    for producer in 0..8u32 {
      let own: Vec<_> = seen.iter().copied().filter(|v| v / 1000 == producer).collect();
      assert_eq!(own, (0..100).map(|i| producer * 1000 + i).collect::<Vec<_>>());
    }
    seen.sort_unstable();
    seen.dedup();
    assert_eq!(seen.len(), 800);
  }

  // ==========================================================================
  // Start / stop
  // ==========================================================================

  #[tokio::test]
  async fn test_second_start_fails() {
    let probe = Probe::default();
    let agent = spawn_agent(&probe);

    assert!(matches!(agent.start(), Err(AgentError::AlreadyStarted)));
    assert!(agent.is_running());

    within(agent.stop(false, None)).await.expect("stop");
    assert!(matches!(agent.start(), Err(AgentError::AlreadyStarted)));
  }

  #[tokio::test(flavor = "multi_thread", worker_threads = 4)]
  async fn test_concurrent_starts_have_one_winner() {
    let probe = Probe::default();
    let agent = Arc::new(Agent::new(RecordingHandler::new(&probe), AgentOptions::new("race")));
    let barrier = Arc::new(tokio::sync::Barrier::new(8));

    let starters: Vec<_> = (0..8)
      .map(|_| {
        let agent = Arc::clone(&agent);
        let barrier = Arc::clone(&barrier);
        tokio::spawn(async move {
          barrier.wait().await;
          agent.start()
        })
      })
      .collect();

    let mut wins = 0;
    for result in within(futures::future::join_all(starters)).await {
      match result.expect("task") {
        Ok(()) => wins += 1,
        Err(AgentError::AlreadyStarted) => {}
        Err(other) => panic!("unexpected start failure: {other:?}"),
      }
    }
    assert_eq!(wins, 1);
    assert!(wait_for(TEST_TIMEOUT, || probe.has_event("start")).await);

    within(agent.stop(false, None)).await.expect("stop");
    assert_eq!(probe.events(), vec!["start", "end"]);
  }

  #[test]
  fn test_start_without_runtime_fails() {
    let probe = Probe::default();
    let agent = Agent::new(RecordingHandler::new(&probe), AgentOptions::new("orphan"));
    assert!(matches!(agent.start(), Err(AgentError::NoRuntime)));
    assert_eq!(agent.state(), AgentState::NotStarted);
  }

  #[tokio::test]
  async fn test_concurrent_stops_share_one_shutdown() {
    let probe = Probe::default();
    let agent = spawn_agent(&probe);
    agent
      .post(TestMessage::Slow(1, Duration::from_millis(50)))
      .await
      .expect("post");

    let (stopped, hook) = counter();
    agent.on_stopped(hook);

    let (first, second) = within(async { tokio::join!(agent.stop(false, None), agent.stop(false, None)) }).await;
    first.expect("first stop");
    second.expect("second stop");

    assert_eq!(probe.seen(), vec![1]);
    assert_eq!(stopped.load(Ordering::SeqCst), 1);

    // Stopping again is a no-op
    within(agent.stop(true, None)).await.expect("third stop");
    assert_eq!(stopped.load(Ordering::SeqCst), 1);
  }

  #[tokio::test]
  async fn test_forced_stop_interrupts_handler_and_discards() {
    let probe = Probe::default();
    let agent = spawn_agent(&probe);
    let mut errors = agent.errors();

    agent.post(TestMessage::Block).await.expect("post block");
    agent.post(TestMessage::Record(1)).await.expect("post record");
    assert!(wait_for(TEST_TIMEOUT, || probe.has_event("block")).await);

    within(agent.shutdown()).await.expect("forced stop");

    assert!(probe.seen().is_empty(), "queued message must not be handled after a forced stop");
    assert_eq!(agent.queue_len(), 0);
    assert!(agent.cancellation_token().is_cancelled());
    assert!(matches!(errors.try_recv(), Err(TryRecvError::Empty)));
    assert_eq!(probe.events(), vec!["start", "block", "end"]);
  }

  #[tokio::test]
  async fn test_stop_timeout_returns_before_drain() {
    let probe = Probe::default();
    let agent = spawn_agent(&probe);
    agent
      .post(TestMessage::Slow(7, Duration::from_millis(300)))
      .await
      .expect("post");
    assert!(wait_for(TEST_TIMEOUT, || probe.has_event("slow-7")).await);

    let started = std::time::Instant::now();
    within(agent.stop(false, Some(Duration::from_millis(20)))).await.expect("stop");
    assert!(started.elapsed() < Duration::from_millis(250));
    assert!(probe.seen().is_empty());

    // The loop keeps draining in the background
    within(agent.completion()).await;
    assert_eq!(probe.seen(), vec![7]);
  }

  #[tokio::test]
  async fn test_completion_after_stopping_unstarted_agent() {
    let probe = Probe::default();
    let agent = Agent::new(RecordingHandler::new(&probe), AgentOptions::new("idle"));
    agent.post(TestMessage::Record(1)).await.expect("post");

    within(agent.stop(false, None)).await.expect("stop");
    within(agent.completion()).await;
    assert_eq!(agent.queue_len(), 0);
    assert!(probe.seen().is_empty());
  }

  #[tokio::test]
  async fn test_external_cancellation_stops_agent() {
    let probe = Probe::default();
    let cancel = CancellationToken::new();
    let agent = Agent::spawn(
      RecordingHandler::new(&probe),
      AgentOptions::new("linked").with_cancel(cancel.clone()),
    )
    .expect("spawn agent");

    cancel.cancel();
    assert!(wait_for(TEST_TIMEOUT, || agent.state() == AgentState::Stopped).await);
    assert!(!agent.is_running());
    assert_eq!(agent.post(TestMessage::Record(1)).await, Err(MailboxError::Cancelled));
    assert!(wait_for(TEST_TIMEOUT, || probe.has_event("end")).await);
  }

  #[tokio::test]
  async fn test_drop_cancels_agent() {
    let probe = Probe::default();
    let agent = spawn_agent(&probe);
    let token = agent.cancellation_token();

    drop(agent);
    assert!(token.is_cancelled());
    assert!(wait_for(TEST_TIMEOUT, || probe.has_event("end")).await);
  }

  // ==========================================================================
  // Faults
  // ==========================================================================

  #[tokio::test]
  async fn test_handler_error_is_published_once() {
    let probe = Probe::default();
    let agent = spawn_agent(&probe);
    let mut errors = agent.errors();
    let (stopped, hook) = counter();
    agent.on_stopped(hook);

    agent.post(TestMessage::Fail("boom".to_string())).await.expect("post");

    let fault = within(errors.recv()).await.expect("fault");
    assert_eq!(fault.stage, FaultStage::MainHandle);
    assert_eq!(&*fault.agent, "test");
    assert!(fault.error.to_string().contains("boom"));

    assert!(wait_for(TEST_TIMEOUT, || agent.state() == AgentState::Stopped).await);
    assert!(!agent.is_running());
    assert!(agent.post(TestMessage::Record(1)).await.is_err());
    assert!(probe.has_event("end"));

    // Stopping a dead agent neither fails, republishes nor fires hooks
    within(agent.stop(false, None)).await.expect("stop");
    assert!(matches!(errors.try_recv(), Err(TryRecvError::Empty)));
    assert_eq!(stopped.load(Ordering::SeqCst), 0);
  }

  #[tokio::test]
  async fn test_cancellation_error_from_handler_releases_callers() {
    let probe = Probe::default();
    let agent = Arc::new(Agent::new(RecordingHandler::new(&probe), AgentOptions::new("quitter")));
    let mut errors = agent.errors();

    agent.post(TestMessage::GiveUp).await.expect("post");
    let queued_ask = tokio::spawn({
      let agent = Arc::clone(&agent);
      async move { agent.ask(|reply| TestMessage::Echo(1, reply)).await }
    });
    assert!(wait_for(TEST_TIMEOUT, || agent.queue_len() == 2).await);

    agent.start().expect("start");

    let outcome = within(queued_ask).await.expect("task");
    assert!(outcome.is_err_and(|e| e.is_cancelled()));
    assert!(wait_for(TEST_TIMEOUT, || agent.state() == AgentState::Stopped).await);
    assert!(probe.has_event("end"));

    // Not a fault, but the agent is dead and must refuse new work
    assert!(matches!(errors.try_recv(), Err(TryRecvError::Empty)));
    assert_eq!(agent.post(TestMessage::Record(1)).await, Err(MailboxError::Cancelled));
    let asked = within(agent.ask(|reply| TestMessage::Echo(2, reply))).await;
    assert!(matches!(asked, Err(AskError::Cancelled)));
    within(agent.completion()).await;
  }

  #[tokio::test]
  async fn test_fault_during_drain_is_returned_by_stop() {
    let probe = Probe::default();
    let agent = Agent::new(RecordingHandler::new(&probe), AgentOptions::new("drain"));
    agent.post(TestMessage::Record(1)).await.expect("post");
    agent.post(TestMessage::Fail("late".to_string())).await.expect("post");
    agent.post(TestMessage::Record(2)).await.expect("post");
    agent.start().expect("start");

    let fault = match within(agent.stop(false, None)).await {
      Err(AgentError::Fault(fault)) => fault,
      other => panic!("expected a fault, got {other:?}"),
    };
    assert_eq!(fault.stage, FaultStage::MainHandle);
    assert_eq!(probe.seen(), vec![1]);
  }

  #[tokio::test]
  async fn test_panic_is_captured_as_fault() {
    let probe = Probe::default();
    let agent = spawn_agent(&probe);
    let mut errors = agent.errors();

    agent.post(TestMessage::Panic).await.expect("post");

    let fault = within(errors.recv()).await.expect("fault");
    assert_eq!(fault.stage, FaultStage::MainHandle);
    assert!(fault.error.to_string().contains("handler exploded"));
    assert!(wait_for(TEST_TIMEOUT, || agent.state() == AgentState::Stopped).await);
  }

  #[tokio::test]
  async fn test_on_start_failure_still_runs_on_end() {
    let probe = Probe::default();
    let agent = Agent::spawn(RecordingHandler::failing_on_start(&probe), AgentOptions::new("broken"))
      .expect("spawn agent");
    let mut errors = agent.errors();

    let fault = within(errors.recv()).await.expect("fault");
    assert_eq!(fault.stage, FaultStage::MainStart);
    assert!(wait_for(TEST_TIMEOUT, || probe.has_event("end")).await);
    assert_eq!(probe.events(), vec!["start", "end"]);
  }

  #[tokio::test]
  async fn test_reported_error_does_not_stop_agent() {
    let probe = Probe::default();
    let agent = spawn_agent(&probe);
    let mut errors = agent.errors();

    agent.report_error(anyhow::anyhow!("disk nearly full"));

    let fault = within(errors.recv()).await.expect("fault");
    assert_eq!(fault.stage, FaultStage::Reported);
    assert!(agent.is_running());

    agent.post(TestMessage::Record(5)).await.expect("post");
    within(agent.stop(false, None)).await.expect("stop");
    assert_eq!(probe.seen(), vec![5]);
  }

  // ==========================================================================
  // Lifecycle hooks
  // ==========================================================================

  #[tokio::test]
  async fn test_lifecycle_hooks_fire_once_each() {
    let probe = Probe::default();
    let agent = Agent::new(RecordingHandler::new(&probe), AgentOptions::new("hooks"));

    let (starting, on_starting) = counter();
    let (stopping, on_stopping) = counter();
    let (stopped, on_stopped) = counter();
    agent.on_starting(on_starting);
    agent.on_stopping(on_stopping);
    agent.on_stopped(on_stopped);

    agent.start().expect("start");
    assert!(wait_for(TEST_TIMEOUT, || probe.has_event("start")).await);

    within(agent.stop(false, None)).await.expect("stop");
    within(agent.stop(false, None)).await.expect("stop again");

    assert_eq!(starting.load(Ordering::SeqCst), 1);
    assert_eq!(stopping.load(Ordering::SeqCst), 1);
    assert_eq!(stopped.load(Ordering::SeqCst), 1);
  }

  #[tokio::test]
  async fn test_stop_before_start_skips_starting_hooks() {
    let probe = Probe::default();
    let agent = Agent::new(RecordingHandler::new(&probe), AgentOptions::new("never"));
    agent.post(TestMessage::Record(1)).await.expect("post");

    let (starting, on_starting) = counter();
    let (stopped, on_stopped) = counter();
    agent.on_starting(on_starting);
    agent.on_stopped(on_stopped);

    within(agent.stop(false, None)).await.expect("stop");

    assert_eq!(starting.load(Ordering::SeqCst), 0);
    assert_eq!(stopped.load(Ordering::SeqCst), 1);
    assert_eq!(agent.queue_len(), 0);
    assert!(probe.seen().is_empty());
    assert!(matches!(agent.start(), Err(AgentError::AlreadyStarted)));
  }
}
