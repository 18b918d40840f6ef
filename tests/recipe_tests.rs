use pumpbus::agent::{AgentConfig, PumpAgent};
use pumpbus::protocol::topics;
use pumpbus::transport::Envelope;
use tokio::sync::mpsc::UnboundedReceiver;
use tokio::time::{sleep, Duration};

fn new_agent(error_rate: f64, seed: u64) -> (PumpAgent, UnboundedReceiver<Envelope>) {
    let (publisher, rx) = pumpbus::transport::channel();
    let agent = PumpAgent::new(
        AgentConfig {
            error_rate,
            seed,
            ..AgentConfig::default()
        },
        publisher,
    );
    (agent, rx)
}

fn drain(rx: &mut UnboundedReceiver<Envelope>) -> Vec<Envelope> {
    let mut events = Vec::new();
    while let Ok(envelope) = rx.try_recv() {
        events.push(envelope);
    }
    events
}

fn topic_events<'a>(events: &'a [Envelope], topic: &str) -> Vec<&'a Envelope> {
    events.iter().filter(|e| e.topic == topic).collect()
}

const TWO_STEP_RECIPE: &[u8] = br#"{
    "pump_id": 1,
    "amount_ml": [
        {"pump_number": 1, "quantity_ml": 40.0, "ingredient": "Gin", "order": 1},
        {"pump_number": 5, "quantity_ml": 20.0, "ingredient": "Tonic", "order": 2}
    ],
    "recipe_name": "G&T"
}"#;

#[tokio::test(start_paused = true)]
async fn test_recipe_reports_cumulative_progress() {
    let (mut agent, mut rx) = new_agent(0.0, 13);

    let session = agent
        .handle_message(topics::DISPENSE_COMMAND, TWO_STEP_RECIPE)
        .expect("session should start");
    session.await.unwrap();

    let events = drain(&mut rx);
    let statuses = topic_events(&events, topics::STATUS);

    // 40ml -> 2000ms -> 5 ticks; 20ml -> 1000ms -> 3 ticks
    assert_eq!(statuses.len(), 8);

    // Every status targets the whole recipe volume
    for status in &statuses {
        assert_eq!(status.payload["target_ml"], 60.0);
    }

    // First step reports pump 1, second step pump 5, strictly in order
    assert!(statuses[..5].iter().all(|s| s.payload["pump_id"] == 1));
    assert!(statuses[5..].iter().all(|s| s.payload["pump_id"] == 5));

    // The last status is the second step at full volume on top of the first
    // step's actual delivery, so it lands within the variance of the total
    let last = statuses.last().unwrap().payload["progress_ml"].as_f64().unwrap();
    assert!(
        (last - 60.0).abs() <= 60.0 * 0.05 + 1e-9,
        "final cumulative progress {} too far from 60.0",
        last
    );
}

#[tokio::test(start_paused = true)]
async fn test_recipe_emits_single_completion_with_totals() {
    let (mut agent, mut rx) = new_agent(0.0, 17);

    let session = agent
        .handle_message(topics::DISPENSE_COMMAND, TWO_STEP_RECIPE)
        .unwrap();
    session.await.unwrap();

    let events = drain(&mut rx);
    let completions = topic_events(&events, topics::DISPENSE_COMPLETE);
    assert_eq!(completions.len(), 1);

    let completion = completions[0];
    assert_eq!(completion.payload["pump_id"], 0);
    assert_eq!(completion.payload["recipe_name"], "G&T");
    assert_eq!(completion.payload["requested_ml"], 60.0);

    let actual = completion.payload["actual_ml"].as_f64().unwrap();
    assert!(
        (57.0..=63.0).contains(&actual),
        "recipe actual_ml {} outside aggregate variance bounds",
        actual
    );

    // 2000ms step + 500ms inter-pump delay + 1000ms step
    assert_eq!(completion.payload["duration_ms"], 3500);
}

#[tokio::test(start_paused = true)]
async fn test_short_steps_floor_at_minimum_duration() {
    let (mut agent, mut rx) = new_agent(0.0, 19);

    // 2ml at 20ml/s derives to 100ms, floored to 500ms
    let session = agent
        .handle_message(
            topics::DISPENSE_COMMAND,
            br#"{"pump_id": 1, "amount_ml": [{"pump_number": 3, "quantity_ml": 2.0, "ingredient": "Bitters"}]}"#,
        )
        .unwrap();
    session.await.unwrap();

    let events = drain(&mut rx);
    let completion = topic_events(&events, topics::DISPENSE_COMPLETE)[0];
    assert_eq!(completion.payload["duration_ms"], 500);
}

#[tokio::test(start_paused = true)]
async fn test_stop_aborts_remaining_steps() {
    let (mut agent, mut rx) = new_agent(0.0, 23);
    let stop = agent.stop_signal();
    let pumps = agent.activity();

    let session = agent
        .handle_message(topics::DISPENSE_COMMAND, TWO_STEP_RECIPE)
        .unwrap();

    // Stop during the first step (runs 0..2000ms)
    sleep(Duration::from_millis(700)).await;
    stop.arm();
    session.await.unwrap();

    let events = drain(&mut rx);
    assert!(topic_events(&events, topics::DISPENSE_COMPLETE).is_empty());

    let errors = topic_events(&events, topics::ERROR);
    assert_eq!(errors.len(), 1);
    assert_eq!(errors[0].payload["error_code"], "EMERGENCY_STOP");
    assert_eq!(errors[0].payload["severity"], "warning");
    assert_eq!(errors[0].payload["pump_id"], 1);

    // The second step never ran
    assert!(topic_events(&events, topics::STATUS)
        .iter()
        .all(|s| s.payload["pump_id"] == 1));

    assert_eq!(pumps.get(), 0);
}

#[tokio::test(start_paused = true)]
async fn test_injected_error_uses_first_ingredient_pump() {
    let (mut agent, mut rx) = new_agent(1.0, 29);

    let session = agent.handle_message(topics::DISPENSE_COMMAND, TWO_STEP_RECIPE);
    assert!(session.is_none());

    let events = drain(&mut rx);
    assert!(topic_events(&events, topics::STATUS).is_empty());

    let errors = topic_events(&events, topics::ERROR);
    assert_eq!(errors.len(), 1);
    assert_eq!(errors[0].payload["pump_id"], 1);
    assert_eq!(errors[0].payload["severity"], "critical");
}

#[tokio::test(start_paused = true)]
async fn test_empty_recipe_completes_with_zero_totals() {
    let (mut agent, mut rx) = new_agent(0.0, 31);

    let session = agent
        .handle_message(
            topics::DISPENSE_COMMAND,
            br#"{"pump_id": 1, "amount_ml": [], "recipe_name": "Nothing"}"#,
        )
        .unwrap();
    session.await.unwrap();

    let events = drain(&mut rx);
    assert!(topic_events(&events, topics::STATUS).is_empty());

    let completion = topic_events(&events, topics::DISPENSE_COMPLETE)[0];
    assert_eq!(completion.payload["requested_ml"], 0.0);
    assert_eq!(completion.payload["actual_ml"], 0.0);
}
