use std::time::Duration;

use bytes::Bytes;
use futures::{StreamExt as _, stream};
use tutor_stream::{
    AbortHandle, AssignmentVariant, CurriculumDay, DriverState, EventPipeline, ExtractStrategy,
    StreamDriver, StreamError, StreamEvent, StreamHandler,
};

#[derive(Default)]
struct Recorder<E> {
    messages: Vec<StreamEvent<E>>,
    errors: Vec<StreamError>,
    completions: Vec<Vec<E>>,
    abort_on_first_item: Option<AbortHandle>,
}

impl<E: Clone> StreamHandler<E> for Recorder<E> {
    fn on_message(&mut self, event: &StreamEvent<E>) {
        self.messages.push(event.clone());
        if matches!(event, StreamEvent::Item { .. })
            && let Some(abort) = &self.abort_on_first_item
        {
            abort.abort();
        }
    }

    fn on_error(&mut self, error: &StreamError) {
        self.errors.push(error.clone());
    }

    fn on_complete(&mut self, entities: &[E]) {
        self.completions.push(entities.to_vec());
    }
}

fn chunks(parts: &[&str]) -> impl futures::Stream<Item = Result<Bytes, StreamError>> + use<> {
    let owned: Vec<Result<Bytes, StreamError>> = parts
        .iter()
        .map(|part| Ok(Bytes::copy_from_slice(part.as_bytes())))
        .collect();
    stream::iter(owned)
}

fn kinds<E>(events: &[StreamEvent<E>]) -> Vec<&'static str>
where
    E: tutor_stream::Entity,
{
    events.iter().map(StreamEvent::kind).collect()
}

#[tokio::test]
async fn example_day_then_done() {
    let mut driver: StreamDriver<CurriculumDay> = StreamDriver::new(ExtractStrategy::Lines);
    let mut recorder = Recorder::default();
    let result = driver
        .drive(
            chunks(&[
                "{\"type\":\"day\",\"day\":{\"day\":1,\"title\":\"A\"}}\n",
                "{\"type\":\"done\",\"totalGenerated\":1}\n",
            ]),
            &mut recorder,
            &AbortHandle::new(),
        )
        .await
        .expect("stream completes");

    assert_eq!(kinds(&recorder.messages), vec!["day", "done"]);
    assert_eq!(recorder.completions, vec![vec![CurriculumDay::new(1, "A")]]);
    assert_eq!(result, vec![CurriculumDay::new(1, "A")]);
}

#[tokio::test]
async fn malformed_line_is_progress_and_stream_completes() {
    let mut driver: StreamDriver<CurriculumDay> = StreamDriver::new(ExtractStrategy::Lines);
    let mut recorder = Recorder::default();
    let result = driver
        .drive(
            chunks(&["not json\n{\"type\":\"done\"}\n"]),
            &mut recorder,
            &AbortHandle::new(),
        )
        .await;

    assert_eq!(result, Ok(Vec::new()));
    assert_eq!(
        recorder.messages,
        vec![StreamEvent::progress("not json"), StreamEvent::done(None)]
    );
    assert_eq!(recorder.completions.len(), 1);
    assert!(recorder.errors.is_empty());
}

#[tokio::test]
async fn duplicate_days_merge_into_one_entity() {
    let mut driver = StreamDriver::new(ExtractStrategy::Lines);
    let mut recorder = Recorder::default();
    let result = driver
        .drive(
            chunks(&[
                "{\"type\":\"day\",\"day\":{\"day\":3,\"title\":\"Loops\"}}\n",
                "{\"type\":\"day\",\"day\":{\"day\":3,\"summary\":\"for and while\",\"objectives\":[\"iterate\"]}}\n",
                "{\"type\":\"done\"}\n",
            ]),
            &mut recorder,
            &AbortHandle::new(),
        )
        .await
        .expect("stream completes");

    assert_eq!(result.len(), 1);
    let day: &CurriculumDay = &result[0];
    assert_eq!(day.title, "Loops");
    assert_eq!(day.summary, "for and while");
    assert_eq!(day.objectives, vec!["iterate".to_string()]);
}

#[tokio::test]
async fn first_terminal_event_wins() {
    let mut driver: StreamDriver<CurriculumDay> = StreamDriver::new(ExtractStrategy::Lines);
    let mut recorder = Recorder::default();
    let result = driver
        .drive(
            chunks(&["{\"type\":\"done\"}\n{\"type\":\"error\",\"error\":\"late\"}\n"]),
            &mut recorder,
            &AbortHandle::new(),
        )
        .await;

    assert_eq!(result, Ok(Vec::new()));
    assert_eq!(kinds(&recorder.messages), vec!["done"]);
    assert_eq!(recorder.completions.len(), 1);
    assert!(recorder.errors.is_empty());
}

#[tokio::test]
async fn unterminated_object_overflows_into_progress() {
    let mut pipeline: EventPipeline<CurriculumDay> =
        EventPipeline::with_max_buffer(ExtractStrategy::Braces, 1024);
    let mut overflowed = Vec::new();
    pipeline.push_bytes(b"{\"type\":\"progress\",\"value\":\"");
    for _ in 0..64 {
        overflowed.extend(pipeline.push_bytes(&[b'x'; 64]));
        assert!(pipeline.extractor().buffered_len() <= 1024);
    }
    match overflowed.first() {
        Some(StreamEvent::Progress { value }) => assert!(value.chars().count() <= 200),
        other => panic!("expected overflow progress, got {other:?}"),
    }

    assert_eq!(overflowed.len(), 1);

    let after = pipeline.push_bytes(b"xx\"}{\"type\":\"done\"}");
    assert_eq!(after, vec![StreamEvent::done(None)]);
}

#[tokio::test]
async fn terminal_error_after_overflowed_value_is_delivered() {
    let mut driver: StreamDriver<CurriculumDay> =
        StreamDriver::with_max_buffer(ExtractStrategy::Braces, 64);
    let mut recorder = Recorder::default();
    let oversized = format!("{{\"type\":\"progress\",\"value\":\"{}", "x".repeat(80));
    let result = driver
        .drive(
            chunks(&[
                oversized.as_str(),
                "xx{ \"}\n{\"type\":\"error\",\"error\":\"quota\"}\n",
            ]),
            &mut recorder,
            &AbortHandle::new(),
        )
        .await;

    assert_eq!(result, Err(StreamError::remote("quota")));
    assert_eq!(kinds(&recorder.messages), vec!["progress", "error"]);
    assert_eq!(recorder.errors, vec![StreamError::remote("quota")]);
    assert!(recorder.completions.is_empty());
}

#[tokio::test]
async fn oversized_line_tail_is_not_replayed_as_progress() {
    let mut driver: StreamDriver<CurriculumDay> =
        StreamDriver::with_max_buffer(ExtractStrategy::Lines, 64);
    let mut recorder = Recorder::default();
    let head = format!("{{\"type\":\"progress\",\"value\":\"{}", "y".repeat(80));
    let tail = format!("{}\"}}\n{{\"type\":\"day\",\"day\":{{\"day\":1,\"title\":\"A\"}}}}\n", "y".repeat(50));
    let result = driver
        .drive(
            chunks(&[head.as_str(), tail.as_str(), "{\"type\":\"done\"}\n"]),
            &mut recorder,
            &AbortHandle::new(),
        )
        .await
        .expect("stream completes");

    assert_eq!(result, vec![CurriculumDay::new(1, "A")]);
    assert_eq!(kinds(&recorder.messages), vec!["progress", "day", "done"]);
}

#[tokio::test]
async fn partial_day_after_full_plan_keeps_complete_copy() {
    let mut driver = StreamDriver::new(ExtractStrategy::Lines);
    let mut recorder = Recorder::default();
    let result = driver
        .drive(
            chunks(&[
                "{\"type\":\"full_plan\",\"days\":[{\"day\":1,\"title\":\"Full\"}]}\n",
                "{\"type\":\"day\",\"day\":{\"day\":1,\"title\":\"Partial title that is longer\",\"summary\":\"s\"}}\n",
                "{\"type\":\"day\",\"day\":{\"day\":7,\"title\":\"late new key\"}}\n",
                "{\"type\":\"done\"}\n",
            ]),
            &mut recorder,
            &AbortHandle::new(),
        )
        .await
        .expect("stream completes");

    assert_eq!(result.len(), 1);
    let day: &CurriculumDay = &result[0];
    assert_eq!(day.title, "Full");
    assert_eq!(day.summary, "s");
    assert_eq!(kinds(&recorder.messages), vec!["full_plan", "day", "day", "done"]);
}

#[tokio::test]
async fn abort_after_first_day_stops_delivery() {
    let abort = AbortHandle::new();
    let mut driver = StreamDriver::new(ExtractStrategy::Lines);
    let mut recorder = Recorder {
        abort_on_first_item: Some(abort.clone()),
        ..Recorder::default()
    };
    let result = driver
        .drive(
            chunks(&[
                "{\"type\":\"day\",\"day\":{\"day\":1,\"title\":\"A\"}}\n",
                "{\"type\":\"day\",\"day\":{\"day\":2,\"title\":\"B\"}}\n",
                "{\"type\":\"done\"}\n",
            ]),
            &mut recorder,
            &abort,
        )
        .await;

    assert_eq!(result, Err::<Vec<CurriculumDay>, _>(StreamError::Cancelled));
    assert_eq!(kinds(&recorder.messages), vec!["day"]);
    assert!(recorder.completions.is_empty());
    assert!(recorder.errors.is_empty());
    assert_eq!(driver.state(), DriverState::Cancelled);
}

#[tokio::test]
async fn abort_interrupts_an_idle_transport() {
    let abort = AbortHandle::new();
    let transport = chunks(&["{\"type\":\"day\",\"day\":{\"day\":1,\"title\":\"A\"}}\n"])
        .chain(stream::pending());
    let remote = abort.clone();
    tokio::spawn(async move {
        tokio::time::sleep(Duration::from_millis(20)).await;
        remote.abort();
    });

    let mut driver = StreamDriver::new(ExtractStrategy::Lines);
    let mut recorder = Recorder::default();
    let result = tokio::time::timeout(
        Duration::from_secs(5),
        driver.drive(transport, &mut recorder, &abort),
    )
    .await
    .expect("abort resolves the stream");

    assert_eq!(result, Err::<Vec<CurriculumDay>, _>(StreamError::Cancelled));
    assert_eq!(kinds(&recorder.messages), vec!["day"]);
    assert!(recorder.completions.is_empty());
}

#[tokio::test]
async fn assignment_stream_with_full_set_finalizes() {
    let mut driver = StreamDriver::new(ExtractStrategy::Lines);
    let mut recorder = Recorder::default();
    let result = driver
        .drive(
            chunks(&[
                ": keepalive\n",
                "data: {\"type\":\"variant\",\"variant\":{\"id\":\"v2\",\"title\":\"Hard\",\"instructions\":\"Sol…\"}}\n\n",
                "data: {\"type\":\"full_set\",\"variants\":[{\"id\":\"v1\",\"title\":\"Easy\"},{\"id\":\"v2\",\"title\":\"Hard\",\"instructions\":\"Solve all\"}]}\n\n",
                "data: [DONE]\n\n",
            ]),
            &mut recorder,
            &AbortHandle::new(),
        )
        .await
        .expect("stream completes at end of transport");

    let ids: Vec<&str> = result.iter().map(|v: &AssignmentVariant| v.id.as_str()).collect();
    assert_eq!(ids, vec!["v1", "v2"]);
    assert_eq!(result[1].instructions, "Solve all");
    assert_eq!(kinds(&recorder.messages), vec!["variant", "full_set"]);
    assert_eq!(recorder.completions.len(), 1);
}

#[tokio::test]
async fn transport_failure_keeps_delivered_events() {
    let mut driver = StreamDriver::new(ExtractStrategy::Lines);
    let mut recorder = Recorder::default();
    let transport = chunks(&["{\"type\":\"day\",\"day\":{\"day\":1,\"title\":\"A\"}}\n"])
        .chain(stream::iter(vec![Err(StreamError::transport("reset"))]));
    let result = driver
        .drive(transport, &mut recorder, &AbortHandle::new())
        .await;

    assert_eq!(result, Err::<Vec<CurriculumDay>, _>(StreamError::transport("reset")));
    assert_eq!(recorder.messages.len(), 1);
    assert_eq!(recorder.errors.len(), 1);
    assert!(recorder.completions.is_empty());
}
