//! Scripted lobby session against an in-memory event API.
//!
//! Drives the query cache the way the quiz client does during a live event:
//! an organizer creates an event, players join, browse the lobby, warm each
//! other's quizzes and answer them round by round.

use std::collections::HashMap;
use std::sync::atomic::{AtomicU32, AtomicU64, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::time::Duration;

use futures::future::join_all;
use serde::Serialize;
use serde_json::json;
use thiserror::Error;
use tracing::{debug, info, warn};

use crate::cache::{
    CacheConfig, CacheKey, FetchError, KeyPattern, Mutation, MutationOptions, PolicyPreset,
    QueryClient,
};
use crate::cache_key;
use crate::config::SimulateArgs;

#[derive(Debug, Error)]
pub enum ApiError {
    #[error("request #{request} failed: service unavailable")]
    Unavailable { request: u32 },
    #[error("{what} `{id}` not found")]
    NotFound { what: &'static str, id: String },
}

impl From<ApiError> for FetchError {
    fn from(error: ApiError) -> Self {
        FetchError::new(error)
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct LobbyEvent {
    pub id: u32,
    pub name: String,
    pub invite_code: String,
    pub attendees: Vec<String>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct Profile {
    pub name: String,
    pub tagline: String,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct Question {
    pub prompt: String,
    pub choices: Vec<String>,
    pub answer: usize,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct Quiz {
    pub owner: String,
    pub questions: Vec<Question>,
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct Tally {
    pub answered: u32,
    pub correct: u32,
}

#[derive(Default)]
struct ApiState {
    events: HashMap<u32, LobbyEvent>,
    tallies: HashMap<String, Tally>,
    next_event_id: u32,
}

/// Stand-in for the remote event API with configurable latency and failures.
pub struct FakeEventApi {
    state: Mutex<ApiState>,
    requests: AtomicU32,
    latency: Duration,
    fail_every: u32,
}

impl FakeEventApi {
    pub fn new(latency: Duration, fail_every: u32) -> Self {
        Self {
            state: Mutex::new(ApiState::default()),
            requests: AtomicU32::new(0),
            latency,
            fail_every,
        }
    }

    /// Requests served so far, failed ones included.
    pub fn requests(&self) -> u32 {
        self.requests.load(Ordering::SeqCst)
    }

    async fn request(&self, op: &'static str) -> Result<(), ApiError> {
        let request = self.requests.fetch_add(1, Ordering::SeqCst) + 1;
        if !self.latency.is_zero() {
            tokio::time::sleep(self.latency).await;
        }
        if self.fail_every > 0 && request % self.fail_every == 0 {
            debug!(op, request, "simulated backend failure");
            return Err(ApiError::Unavailable { request });
        }
        debug!(op, request, "backend request served");
        Ok(())
    }

    fn state(&self) -> MutexGuard<'_, ApiState> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }

    pub async fn create_event(&self, name: &str) -> Result<LobbyEvent, ApiError> {
        self.request("create_event").await?;
        let mut state = self.state();
        state.next_event_id += 1;
        let id = state.next_event_id;
        let event = LobbyEvent {
            id,
            name: name.to_string(),
            invite_code: format!("ICE-{id:04}"),
            attendees: Vec::new(),
        };
        state.events.insert(id, event.clone());
        Ok(event)
    }

    pub async fn join_event(&self, id: u32, player: &str) -> Result<LobbyEvent, ApiError> {
        self.request("join_event").await?;
        let mut state = self.state();
        let event = state.events.get_mut(&id).ok_or_else(|| ApiError::NotFound {
            what: "event",
            id: id.to_string(),
        })?;
        if !event.attendees.iter().any(|name| name == player) {
            event.attendees.push(player.to_string());
        }
        Ok(event.clone())
    }

    pub async fn list_events(&self) -> Result<Vec<LobbyEvent>, ApiError> {
        self.request("list_events").await?;
        let mut events: Vec<LobbyEvent> = self.state().events.values().cloned().collect();
        events.sort_by_key(|event| event.id);
        Ok(events)
    }

    pub async fn event(&self, id: u32) -> Result<LobbyEvent, ApiError> {
        self.request("event").await?;
        self.state()
            .events
            .get(&id)
            .cloned()
            .ok_or_else(|| ApiError::NotFound {
                what: "event",
                id: id.to_string(),
            })
    }

    pub async fn profile(&self, name: &str) -> Result<Profile, ApiError> {
        self.request("profile").await?;
        Ok(Profile {
            name: name.to_string(),
            tagline: format!("{name} likes quizzes"),
        })
    }

    pub async fn quiz(&self, owner: &str) -> Result<Quiz, ApiError> {
        self.request("quiz").await?;
        Ok(sample_quiz(owner))
    }

    pub async fn submit_answer(&self, owner: &str, round: usize, choice: usize) -> Result<bool, ApiError> {
        self.request("submit_answer").await?;
        let quiz = sample_quiz(owner);
        let correct = quiz
            .questions
            .get(round % quiz.questions.len())
            .is_some_and(|question| question.answer == choice);
        let mut state = self.state();
        let tally = state.tallies.entry(owner.to_string()).or_default();
        tally.answered += 1;
        tally.correct += u32::from(correct);
        Ok(correct)
    }

    pub async fn tally(&self, owner: &str) -> Result<Tally, ApiError> {
        self.request("tally").await?;
        Ok(self.state().tallies.get(owner).copied().unwrap_or_default())
    }
}

fn sample_quiz(owner: &str) -> Quiz {
    let seed = owner.len();
    let questions = ["favourite language", "first computer", "dream conference"]
        .into_iter()
        .enumerate()
        .map(|(index, topic)| Question {
            prompt: format!("What is {owner}'s {topic}?"),
            choices: vec!["A".into(), "B".into(), "C".into()],
            answer: (seed + index) % 3,
        })
        .collect();
    Quiz {
        owner: owner.to_string(),
        questions,
    }
}

/// Shape of one simulated session.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SimulationPlan {
    pub players: u32,
    pub rounds: u32,
    pub latency: Duration,
    pub fail_every: u32,
}

impl From<&SimulateArgs> for SimulationPlan {
    fn from(args: &SimulateArgs) -> Self {
        Self {
            players: args.players,
            rounds: args.rounds,
            latency: Duration::from_millis(args.latency_ms),
            fail_every: args.fail_every,
        }
    }
}

/// What a session did to the backend and the cache.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct SimulationReport {
    pub event: Option<LobbyEvent>,
    pub reads: u32,
    pub backend_requests: u32,
    pub failures: u32,
    pub notifications: u64,
    pub cached_entries: usize,
    pub correct_answers: u32,
}

fn events_list_key() -> CacheKey {
    cache_key!["events", "list"]
}

fn event_key(id: u32) -> CacheKey {
    cache_key!["events", "detail", { "id": id }]
}

fn profile_key(name: &str) -> CacheKey {
    cache_key!["profile", name]
}

fn quiz_key(owner: &str) -> CacheKey {
    cache_key!["quiz", owner]
}

fn tally_key(owner: &str) -> CacheKey {
    cache_key!["quiz", owner, "tally"]
}

/// Play one lobby session. Fails only if the event cannot be created.
pub async fn run(
    client: &QueryClient,
    policies: &CacheConfig,
    plan: SimulationPlan,
) -> Result<SimulationReport, FetchError> {
    let api = Arc::new(FakeEventApi::new(plan.latency, plan.fail_every));
    let notifications = Arc::new(AtomicU64::new(0));
    let seen = Arc::clone(&notifications);
    let _watch_all = client.subscribe_global(move |_| {
        seen.fetch_add(1, Ordering::Relaxed);
    });
    let mut report = SimulationReport::default();

    let create = {
        let api = Arc::clone(&api);
        Mutation::new(
            client.clone(),
            move |name: String| {
                let api = Arc::clone(&api);
                async move { api.create_event(&name).await }
            },
            MutationOptions::new().invalidate(KeyPattern::prefix(vec![json!("events")])),
        )
    };
    let event = create.mutate("Rust meetup".to_string()).await?;
    info!(event_id = event.id, code = %event.invite_code, "event created");

    let players: Vec<String> = (1..=plan.players).map(|i| format!("player-{i}")).collect();

    let join = {
        let api = Arc::clone(&api);
        let event_id = event.id;
        Mutation::new(
            client.clone(),
            move |player: String| {
                let api = Arc::clone(&api);
                async move { api.join_event(event_id, &player).await }
            },
            MutationOptions::new()
                .invalidate(event_key(event.id))
                .invalidate(events_list_key()),
        )
    };
    for player in &players {
        if let Err(error) = join.mutate(player.clone()).await {
            warn!(player = %player, error = %error, "join failed");
            report.failures += 1;
        }
    }

    // Every player opens the lobby at once: one backend read for the list.
    let external = policies.policy(PolicyPreset::External);
    let lobby_reads = players.iter().map(|_| {
        let api = Arc::clone(&api);
        client.fetch_query(&events_list_key(), move || async move { api.list_events().await }, external)
    });
    for outcome in join_all(lobby_reads).await {
        report.reads += 1;
        if outcome.is_err() {
            report.failures += 1;
        }
    }

    let personal = policies.policy(PolicyPreset::Personal);
    for player in &players {
        let api = Arc::clone(&api);
        let name = player.clone();
        report.reads += 1;
        let read = client
            .fetch_query(&profile_key(player), move || async move { api.profile(&name).await }, personal)
            .await;
        if read.is_err() {
            report.failures += 1;
        }
    }

    let static_policy = policies.policy(PolicyPreset::Static);
    let warmups = players.iter().map(|owner| {
        let api = Arc::clone(&api);
        let owner_name = owner.clone();
        (quiz_key(owner), move || async move { api.quiz(&owner_name).await })
    });
    let warmed = client.prefetch_many(warmups, static_policy).await;
    debug!(warmed, "quizzes prefetched");

    let volatile = policies.policy(PolicyPreset::Volatile);
    for round in 0..plan.rounds as usize {
        for (index, player) in players.iter().enumerate() {
            let owner = &players[(index + 1) % players.len()];
            let quiz_api = Arc::clone(&api);
            let quiz_owner = owner.clone();
            report.reads += 1;
            let quiz = match client
                .fetch_query(&quiz_key(owner), move || async move { quiz_api.quiz(&quiz_owner).await }, static_policy)
                .await
            {
                Ok(quiz) => quiz,
                Err(error) => {
                    warn!(player = %player, owner = %owner, error = %error, "quiz unavailable");
                    report.failures += 1;
                    continue;
                }
            };

            let choice = quiz
                .questions
                .get(round % quiz.questions.len().max(1))
                .map_or(0, |question| (question.answer + index) % 3);
            let answer = {
                let api = Arc::clone(&api);
                let options = MutationOptions::new().invalidate(tally_key(owner));
                let owner = owner.clone();
                Mutation::new(
                    client.clone(),
                    move |choice: usize| {
                        let api = Arc::clone(&api);
                        let owner = owner.clone();
                        async move { api.submit_answer(&owner, round, choice).await }
                    },
                    options,
                )
            };
            match answer.mutate(choice).await {
                Ok(true) => report.correct_answers += 1,
                Ok(false) => {}
                Err(error) => {
                    warn!(player = %player, error = %error, "answer rejected");
                    report.failures += 1;
                    continue;
                }
            }

            let tally_api = Arc::clone(&api);
            let tally_owner = owner.clone();
            report.reads += 1;
            match client
                .fetch_query(&tally_key(owner), move || async move { tally_api.tally(&tally_owner).await }, volatile)
                .await
            {
                Ok(tally) => debug!(owner = %owner, answered = tally.answered, correct = tally.correct, "tally refreshed"),
                Err(_) => report.failures += 1,
            }
        }
    }

    let detail_api = Arc::clone(&api);
    let event_id = event.id;
    report.reads += 1;
    report.event = client
        .fetch_query(&event_key(event_id), move || async move { detail_api.event(event_id).await }, external)
        .await
        .ok()
        .or(Some(event));
    report.backend_requests = api.requests();
    report.notifications = notifications.load(Ordering::Relaxed);
    report.cached_entries = client.store().len();
    info!(
        reads = report.reads,
        backend_requests = report.backend_requests,
        failures = report.failures,
        cached_entries = report.cached_entries,
        "simulation finished"
    );
    Ok(report)
}
