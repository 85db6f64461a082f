//! Scan pipeline tests: filtering, fan-out, ordering and scan-stage faults.

#[cfg(test)]
mod tests {
  use pretty_assertions::assert_eq;

  use crate::{
    __tests__::helpers::{Probe, RecordingHandler, ScanMode, TEST_TIMEOUT, TestMessage, TestScan, wait_for, within},
    Agent, AgentOptions, AgentState, AskError, Capacity, FaultStage,
  };

  fn scan_agent(probe: &Probe, mode: ScanMode) -> Agent<TestMessage> {
    let options = AgentOptions::new("scanned").with_scan_handler(TestScan::new(mode, probe));
    Agent::spawn(RecordingHandler::new(probe), options).expect("spawn agent")
  }

  async fn post_records(agent: &Agent<TestMessage>, values: impl IntoIterator<Item = u32>) {
    for value in values {
      agent.post(TestMessage::Record(value)).await.expect("post");
    }
  }

  #[tokio::test]
  async fn test_passthrough_preserves_order() {
    let probe = Probe::default();
    let agent = scan_agent(&probe, ScanMode::Passthrough);

    post_records(&agent, 1..=20).await;
    within(agent.stop(false, None)).await.expect("stop");

    assert_eq!(probe.seen(), (1..=20).collect::<Vec<_>>());
  }

  #[tokio::test]
  async fn test_scan_absorbs_messages() {
    let probe = Probe::default();
    let agent = scan_agent(&probe, ScanMode::DropEveryThird);

    post_records(&agent, 1..=9).await;
    within(agent.stop(false, None)).await.expect("stop");

    assert_eq!(probe.seen(), vec![1, 2, 4, 5, 7, 8]);
  }

  #[tokio::test]
  async fn test_scan_fans_out_in_order() {
    let probe = Probe::default();
    let agent = scan_agent(&probe, ScanMode::Duplicate);

    post_records(&agent, 1..=3).await;
    within(agent.stop(false, None)).await.expect("stop");

    assert_eq!(probe.seen(), vec![1, 1, 2, 2, 3, 3]);
  }

  #[tokio::test]
  async fn test_bounded_scan_output_still_delivers_everything() {
    let probe = Probe::default();
    let options = AgentOptions::new("narrow")
      .with_capacity(Capacity::Bounded(2))
      .with_scan_capacity(Capacity::Bounded(1))
      .with_scan_handler(TestScan::new(ScanMode::Duplicate, &probe));
    let agent = Agent::spawn(RecordingHandler::new(&probe), options).expect("spawn agent");

    post_records(&agent, 0..10).await;
    within(agent.stop(false, None)).await.expect("stop");

    let expected: Vec<u32> = (0..10).flat_map(|v| [v, v]).collect();
    assert_eq!(probe.seen(), expected);
  }

  #[tokio::test]
  async fn test_graceful_stop_drains_both_stages() {
    let probe = Probe::default();
    let agent = scan_agent(&probe, ScanMode::Passthrough);

    post_records(&agent, 0..5).await;
    within(agent.stop(false, None)).await.expect("stop");

    assert_eq!(probe.seen().len(), 5);
    assert!(probe.has_event("scan-end"));
    assert!(probe.has_event("end"));
    within(agent.completion()).await;
  }

  #[tokio::test]
  async fn test_ask_passes_through_scan() {
    let probe = Probe::default();
    let agent = scan_agent(&probe, ScanMode::Passthrough);

    let value = within(agent.ask(|reply| TestMessage::Echo(5, reply))).await.expect("ask");
    assert_eq!(value, 10);
  }

  #[tokio::test]
  async fn test_scan_fault_stops_agent() {
    let probe = Probe::default();
    let agent = scan_agent(&probe, ScanMode::FailOn(2));
    let mut errors = agent.errors();

    post_records(&agent, 1..=3).await;

    let fault = within(errors.recv()).await.expect("fault");
    assert_eq!(fault.stage, FaultStage::ScanHandle);
    assert!(fault.error.to_string().contains("scan rejected 2"));

    assert!(wait_for(TEST_TIMEOUT, || agent.state() == AgentState::Stopped).await);
    assert!(!probe.seen().contains(&3));

    let result = within(agent.ask(|reply| TestMessage::Echo(1, reply))).await;
    assert!(matches!(result, Err(AskError::Cancelled)));

    // Only the scan fault is published; the main loop was merely cancelled
    within(agent.stop(false, None)).await.expect("stop");
    assert!(errors.try_recv().is_err());
  }
}
