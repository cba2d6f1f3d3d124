use std::{
    sync::{
        Arc, Mutex, PoisonError,
        atomic::{AtomicU64, Ordering},
        mpsc,
    },
    thread::JoinHandle,
    time::{Duration, Instant},
};

use crate::{
    dispatcher::{QueryDispatcher, QueryMetadata, QueryRequest},
    error::{ChatError, Result},
};

/// Represents the current state of the dispatch engine.
#[derive(Clone, Debug, PartialEq)]
pub enum AskEngineState {
    /// Waiting for questions.
    Idle,
    /// A question is with the dispatcher.
    Processing,
}

impl AskEngineState {
    pub fn as_str(&self) -> &'static str {
        match self {
            AskEngineState::Idle => "idle",
            AskEngineState::Processing => "processing",
        }
    }
}

/// A question queued for the worker, tagged with the session that asked it.
pub struct AskEngineRequest<K> {
    pub id: u64,
    pub session: K,
    pub request: QueryRequest,
}

/// Outcome of one queued question, with timing data.
pub struct AskEngineResponse<K> {
    /// Identifier returned by [`AskEngine::schedule`].
    pub id: u64,
    pub session: K,
    pub start_time: Instant,
    pub duration: Duration,
    pub metadata: QueryMetadata,
    pub result: Result<String>,
}

pub enum AskEngineResult<K> {
    Success(AskEngineResponse<K>),
    /// Nothing finished yet.
    Empty(AskEngineState),
    Error(String),
}

/// Runs dispatcher calls on a background thread so that callers living on an
/// event loop never block on the inference server.
///
/// Questions are answered one at a time in the order they were scheduled. A
/// failed question is reported through its response and the worker keeps
/// going. Questions that must not wait for each other belong on separate
/// engines.
pub struct AskEngine<K: Send + 'static> {
    state: Arc<Mutex<AskEngineState>>,
    req_tx: Option<mpsc::Sender<AskEngineRequest<K>>>,
    rep_rx: Mutex<mpsc::Receiver<AskEngineResponse<K>>>,
    worker_handle: Option<JoinHandle<()>>,
    id_counter: AtomicU64,
}

impl<K: Send + 'static> AskEngine<K> {
    /// Moves `dispatcher` to a new worker thread and starts accepting questions.
    pub fn new<D: QueryDispatcher + Send + 'static>(dispatcher: D) -> Self {
        let (req_tx, req_rx) = mpsc::channel::<AskEngineRequest<K>>();
        let (rep_tx, rep_rx) = mpsc::channel::<AskEngineResponse<K>>();
        let state = Arc::new(Mutex::new(AskEngineState::Idle));

        let worker_handle = std::thread::spawn({
            let state = state.clone();
            move || {
                while let Ok(req) = req_rx.recv() {
                    log::debug!("Dispatching question {}", req.id);

                    let metadata = req.request.metadata();

                    set_state(&state, AskEngineState::Processing);
                    let start_time = Instant::now();

                    let result = req.request.dispatch(&dispatcher);

                    log::debug!(
                        "Question {} finished in {:?} (ok: {})",
                        req.id,
                        start_time.elapsed(),
                        result.is_ok()
                    );

                    let _ = rep_tx.send(AskEngineResponse {
                        id: req.id,
                        session: req.session,
                        start_time,
                        duration: start_time.elapsed(),
                        metadata,
                        result,
                    });

                    set_state(&state, AskEngineState::Idle);
                }
            }
        });

        Self {
            state,
            req_tx: Some(req_tx),
            rep_rx: Mutex::new(rep_rx),
            worker_handle: Some(worker_handle),
            id_counter: AtomicU64::new(0),
        }
    }

    pub fn state(&self) -> AskEngineState {
        self.state
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .clone()
    }

    /// Returns a finished answer if there is one, without blocking.
    pub fn try_poll_response(&self) -> AskEngineResult<K> {
        match self
            .rep_rx
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .try_recv()
        {
            Ok(response) => AskEngineResult::Success(response),
            Err(mpsc::TryRecvError::Empty) => AskEngineResult::Empty(self.state()),
            Err(mpsc::TryRecvError::Disconnected) => {
                log::error!("Response channel disconnected");
                AskEngineResult::Error("Response channel disconnected".to_string())
            }
        }
    }

    /// Queues a question for `session` and returns its identifier.
    pub fn schedule(&self, session: K, request: QueryRequest) -> Result<u64> {
        let tx = self
            .req_tx
            .as_ref()
            .ok_or_else(|| ChatError::Inference("engine is stopped".to_string()))?;

        let id = self.id_counter.fetch_add(1, Ordering::Relaxed);
        tx.send(AskEngineRequest {
            id,
            session,
            request,
        })
        .map_err(|_| ChatError::Inference("engine worker is gone".to_string()))?;

        Ok(id)
    }

    /// Closes the queue and waits for the worker to answer what is left.
    pub fn stop(&mut self) {
        self.req_tx.take();
        if let Some(handle) = self.worker_handle.take() {
            let _ = handle.join();
        }
    }
}

impl<K: Send + 'static> Drop for AskEngine<K> {
    fn drop(&mut self) {
        self.stop();
    }
}

fn set_state(state: &Mutex<AskEngineState>, value: AskEngineState) {
    *state.lock().unwrap_or_else(PoisonError::into_inner) = value;
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{directory::ModelId, encoder::EncodedImage};

    struct EchoDispatcher;

    impl QueryDispatcher for EchoDispatcher {
        fn ask(&self, question: &str, _: &[EncodedImage], model: &ModelId) -> Result<String> {
            if question == "fail" {
                return Err(ChatError::Inference("model crashed".to_string()));
            }
            Ok(format!("{} says: {}", model, question))
        }
    }

    fn request(question: &str) -> QueryRequest {
        QueryRequest {
            question: question.to_string(),
            images: Vec::new(),
            model: ModelId::from("llava"),
        }
    }

    fn wait_for(engine: &AskEngine<&'static str>) -> AskEngineResponse<&'static str> {
        let deadline = Instant::now() + Duration::from_secs(5);
        loop {
            match engine.try_poll_response() {
                AskEngineResult::Success(response) => return response,
                AskEngineResult::Empty(_) if Instant::now() < deadline => {
                    std::thread::sleep(Duration::from_millis(5))
                }
                AskEngineResult::Empty(_) => panic!("no response in time"),
                AskEngineResult::Error(e) => panic!("{}", e),
            }
        }
    }

    #[test]
    fn answers_are_tagged_with_their_session() {
        let engine = AskEngine::new(EchoDispatcher);
        assert_eq!(engine.state(), AskEngineState::Idle);

        let first = engine.schedule("tab-1", request("hello")).unwrap();
        let second = engine.schedule("tab-2", request("bye")).unwrap();
        assert_ne!(first, second);

        let response = wait_for(&engine);
        assert_eq!(response.id, first);
        assert_eq!(response.session, "tab-1");
        assert_eq!(response.metadata.question, "hello");
        assert_eq!(response.result.unwrap(), "llava says: hello");

        let response = wait_for(&engine);
        assert_eq!(response.session, "tab-2");
    }

    #[test]
    fn failures_do_not_stop_the_worker() {
        let engine = AskEngine::new(EchoDispatcher);

        engine.schedule("tab", request("fail")).unwrap();
        engine.schedule("tab", request("again")).unwrap();

        assert!(matches!(
            wait_for(&engine).result,
            Err(ChatError::Inference(_))
        ));
        assert!(wait_for(&engine).result.is_ok());
    }

    /// Waits until a second question is in flight, or gives up.
    struct RendezvousDispatcher {
        in_flight: Arc<(Mutex<usize>, std::sync::Condvar)>,
    }

    impl QueryDispatcher for RendezvousDispatcher {
        fn ask(&self, _: &str, _: &[EncodedImage], _: &ModelId) -> Result<String> {
            let (count, arrived) = &*self.in_flight;
            let mut count = count.lock().unwrap();
            *count += 1;
            arrived.notify_all();
            let (count, _) = arrived
                .wait_timeout_while(count, Duration::from_secs(2), |count| *count < 2)
                .unwrap();
            Ok(if *count >= 2 { "together" } else { "alone" }.to_string())
        }
    }

    #[test]
    fn separate_engines_answer_concurrently() {
        let in_flight = Arc::new((Mutex::new(0), std::sync::Condvar::new()));
        let first = AskEngine::new(RendezvousDispatcher {
            in_flight: in_flight.clone(),
        });
        let second = AskEngine::new(RendezvousDispatcher { in_flight });

        first.schedule("tab-1", request("a")).unwrap();
        second.schedule("tab-2", request("b")).unwrap();

        assert_eq!(wait_for(&first).result.unwrap(), "together");
        assert_eq!(wait_for(&second).result.unwrap(), "together");
    }

    #[test]
    fn stopped_engine_refuses_questions() {
        let mut engine = AskEngine::new(EchoDispatcher);
        engine.stop();

        assert!(engine.schedule("tab", request("late")).is_err());
        assert!(matches!(
            engine.try_poll_response(),
            AskEngineResult::Error(_)
        ));
    }
}
