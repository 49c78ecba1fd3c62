//! Interactive broadcast client.
//!
//! One task follows the event stream and keeps the connection id current;
//! the input loop publishes typed lines against whichever connection is live.
//! Every message gets one idempotency token that is reused across retries, so
//! a publish whose acknowledgement was lost is never stored twice.

use std::{path::PathBuf, sync::Arc, time::Duration};

use anyhow::{Context, Result, anyhow, bail};
use chrono::Local;
use clap::Args;
use futures_util::StreamExt;
use reqwest::{Client, StatusCode, header::ACCEPT};
use shared::models::{
    ClientEvent, MessageEvent, NicknameEvent, NicknameRequest, PublishAck, PublishRequest,
    SequenceId,
};
use tokio::{
    io::{AsyncBufReadExt, BufReader},
    sync::{Mutex, mpsc, watch},
    time::{sleep, timeout},
};
use url::Url;
use uuid::Uuid;

use super::{
    sse::{SseFrame, SseParser},
    state::{self, ClientState},
};

const RECONNECT_INITIAL: Duration = Duration::from_millis(500);
const RECONNECT_MAX: Duration = Duration::from_secs(30);

#[derive(Args, Debug)]
#[command(about = "Join the broadcast: print the stream and publish typed lines")]
pub struct ChatArgs {
    /// Relay server base URL (default: <http://localhost:3000>)
    #[arg(long, default_value = "http://localhost:3000")]
    pub server: String,

    /// Nickname to take once connected; remembered for later runs
    #[arg(long)]
    pub nickname: Option<String>,

    /// File holding the last seen offset, session and nickname
    #[arg(long)]
    pub state_file: Option<PathBuf>,
}

/// Parses a server URL and makes it joinable with relative API paths.
///
/// # Errors
/// Returns an error for unparsable URLs or non-HTTP schemes.
pub fn parse_server(raw: &str) -> Result<Url> {
    let mut url = Url::parse(raw).with_context(|| format!("invalid server URL '{raw}'"))?;
    if !matches!(url.scheme(), "http" | "https") {
        bail!("server URL must use http or https, got '{}'", url.scheme());
    }
    if !url.path().ends_with('/') {
        let path = format!("{}/", url.path());
        url.set_path(&path);
    }
    Ok(url)
}

/// Doubling delay with a ceiling.
#[derive(Debug, Clone)]
pub struct Backoff {
    initial: Duration,
    max: Duration,
    current: Duration,
}

impl Backoff {
    #[must_use]
    pub fn new(initial: Duration, max: Duration) -> Self {
        Self {
            initial,
            max,
            current: initial,
        }
    }

    pub fn next_delay(&mut self) -> Duration {
        let delay = self.current;
        self.current = (self.current * 2).min(self.max);
        delay
    }

    pub fn reset(&mut self) {
        self.current = self.initial;
    }
}

/// How hard a single publish is retried before giving up.
#[derive(Debug, Clone, Copy)]
pub struct RetryPolicy {
    pub attempts: u32,
    pub initial: Duration,
    pub max: Duration,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            attempts: 8,
            initial: Duration::from_millis(250),
            max: Duration::from_secs(5),
        }
    }
}

enum Attempt {
    Acked(PublishAck),
    Retry(String),
    Rejected(String),
}

/// Thin wrapper over the relay HTTP API.
#[derive(Debug, Clone)]
pub struct Api {
    client: Client,
    base: Url,
}

impl Api {
    /// # Errors
    /// Returns an error if the HTTP client cannot be built.
    pub fn new(base: Url) -> Result<Self> {
        let client = Client::builder()
            .connect_timeout(Duration::from_secs(5))
            .build()
            .context("building HTTP client")?;
        Ok(Self { client, base })
    }

    fn stream_url(&self, offset: SequenceId, session: Option<Uuid>) -> Result<Url> {
        let mut url = self.base.join("api/stream")?;
        {
            let mut query = url.query_pairs_mut();
            query.append_pair("offset", &offset.to_string());
            if let Some(session) = session {
                query.append_pair("session", &session.to_string());
            }
        }
        Ok(url)
    }

    async fn publish_once(&self, connection: Uuid, request: &PublishRequest) -> Attempt {
        let url = match self
            .base
            .join(&format!("api/connections/{connection}/messages"))
        {
            Ok(url) => url,
            Err(err) => return Attempt::Rejected(err.to_string()),
        };
        let response = match self.client.post(url).json(request).send().await {
            Ok(response) => response,
            Err(err) => return Attempt::Retry(format!("network error: {err}")),
        };

        let status = response.status();
        if status.is_success() {
            // The message is stored either way; a retry with the same token
            // comes back as a duplicate.
            return match response.json::<PublishAck>().await {
                Ok(ack) => Attempt::Acked(ack),
                Err(err) => Attempt::Retry(format!("unreadable acknowledgement: {err}")),
            };
        }

        let detail = problem_message(response).await;
        if status == StatusCode::NOT_FOUND || status.is_server_error() {
            Attempt::Retry(format!("{status}: {detail}"))
        } else {
            Attempt::Rejected(format!("{status}: {detail}"))
        }
    }

    /// Changes the nickname of a live connection.
    ///
    /// # Errors
    /// Returns an error when the request fails or the server rejects the name.
    pub async fn rename(&self, connection: Uuid, nickname: &str) -> Result<NicknameEvent> {
        let url = self
            .base
            .join(&format!("api/connections/{connection}/nickname"))?;
        let response = self
            .client
            .put(url)
            .json(&NicknameRequest {
                nickname: nickname.to_string(),
            })
            .send()
            .await
            .context("sending nickname change")?;

        let status = response.status();
        if !status.is_success() {
            bail!("{status}: {}", problem_message(response).await);
        }
        response
            .json::<NicknameEvent>()
            .await
            .context("reading nickname response")
    }
}

/// Pulls the human-readable message out of a problem body, if there is one.
async fn problem_message(response: reqwest::Response) -> String {
    let text = response.text().await.unwrap_or_default();
    serde_json::from_str::<serde_json::Value>(&text)
        .ok()
        .and_then(|value| value["message"].as_str().map(str::to_string))
        .unwrap_or(text)
}

/// Publishes `content`, retrying transient failures with the same token.
///
/// Waits for a live connection before each attempt, so a publish typed during
/// a reconnect goes out once the stream is back.
///
/// # Errors
/// Returns an error when the server rejects the message outright, or when no
/// attempt was acknowledged. In the second case the message may or may not
/// have been stored.
pub async fn publish_with_retry(
    api: &Api,
    connection: &mut watch::Receiver<Option<Uuid>>,
    content: String,
    policy: RetryPolicy,
) -> Result<PublishAck> {
    let request = PublishRequest {
        content,
        idempotency_token: Some(Uuid::new_v4().to_string()),
    };
    let mut backoff = Backoff::new(policy.initial, policy.max);
    let mut last_error = String::from("not connected");

    for attempt in 1..=policy.attempts {
        let current = match timeout(policy.max, connection.wait_for(Option::is_some)).await {
            Ok(Ok(current)) => *current,
            Ok(Err(_)) => bail!("stream follower stopped"),
            Err(_) => {
                last_error = "not connected".to_string();
                None
            }
        };

        if let Some(id) = current {
            match api.publish_once(id, &request).await {
                Attempt::Acked(ack) => return Ok(ack),
                Attempt::Rejected(reason) => bail!("message rejected: {reason}"),
                Attempt::Retry(reason) => last_error = reason,
            }
        }

        if attempt < policy.attempts {
            sleep(backoff.next_delay()).await;
        }
    }

    Err(anyhow!(
        "message not acknowledged after {} attempts ({last_error}); it may or may not have been stored",
        policy.attempts
    ))
}

/// Follows the event stream forever, reconnecting with backoff.
#[derive(Debug)]
pub struct Follower {
    api: Api,
    state: Arc<Mutex<ClientState>>,
    state_path: PathBuf,
    connection: watch::Sender<Option<Uuid>>,
    output: mpsc::UnboundedSender<String>,
    backoff: Backoff,
}

impl Follower {
    #[must_use]
    pub fn new(
        api: Api,
        state: Arc<Mutex<ClientState>>,
        state_path: PathBuf,
        connection: watch::Sender<Option<Uuid>>,
        output: mpsc::UnboundedSender<String>,
    ) -> Self {
        Self {
            api,
            state,
            state_path,
            connection,
            output,
            backoff: Backoff::new(RECONNECT_INITIAL, RECONNECT_MAX),
        }
    }

    pub async fn run(mut self) {
        loop {
            match self.follow_once().await {
                Ok(()) => self.say("[stream closed; reconnecting]"),
                Err(err) => self.say(format!("[stream failed: {err:#}; reconnecting]")),
            }
            self.connection.send_replace(None);
            sleep(self.backoff.next_delay()).await;
        }
    }

    async fn follow_once(&mut self) -> Result<()> {
        let url = {
            let state = self.state.lock().await;
            self.api.stream_url(state.last_offset, state.session)?
        };
        let response = self
            .api
            .client
            .get(url)
            .header(ACCEPT, "text/event-stream")
            .send()
            .await
            .context("connecting to the stream")?
            .error_for_status()
            .context("stream refused")?;

        let mut parser = SseParser::default();
        let mut body = response.bytes_stream();
        while let Some(chunk) = body.next().await {
            let chunk = chunk.context("reading the stream")?;
            for frame in parser.push(&chunk) {
                self.handle_frame(frame).await?;
            }
        }
        Ok(())
    }

    async fn handle_frame(&mut self, frame: SseFrame) -> Result<()> {
        let Some(event) = ClientEvent::from_parts(&frame.event, &frame.data)
            .with_context(|| format!("malformed '{}' event", frame.event))?
        else {
            return Ok(());
        };

        match event {
            ClientEvent::Session(session) => {
                self.backoff.reset();
                let wanted = {
                    let mut state = self.state.lock().await;
                    state.session = Some(session.connection_id);
                    self.persist(&state);
                    state.nickname.clone()
                };
                self.connection.send_replace(Some(session.connection_id));

                let how = if session.recovered { "resumed" } else { "connected" };
                self.say(format!("[{how} as {}]", session.nickname));

                if let Some(wanted) = wanted.filter(|wanted| *wanted != session.nickname)
                    && let Err(err) = self.api.rename(session.connection_id, &wanted).await
                {
                    self.say(format!("[could not take nickname {wanted}: {err:#}]"));
                }
            }
            ClientEvent::Message(message) => {
                // The server never sends an id twice on one connection; every
                // message is shown, even one that arrives after a higher id.
                {
                    let mut state = self.state.lock().await;
                    if state.advance(message.sequence_id) {
                        self.persist(&state);
                    }
                }
                self.say(render_message(&message));
            }
            ClientEvent::Presence(presence) => self.say(format!("* {}", presence.text)),
            ClientEvent::Nickname(nickname) => {
                self.say(format!("[you are now {}]", nickname.nickname));
            }
            ClientEvent::HistoryIncomplete(gap) => self.say(format!(
                "[history after #{} could not be loaded: {}]",
                gap.resume_offset, gap.reason
            )),
        }
        Ok(())
    }

    fn persist(&self, state: &ClientState) {
        if let Err(err) = state.save(&self.state_path) {
            self.say(format!("[could not save client state: {err:#}]"));
        }
    }

    fn say(&self, line: impl Into<String>) {
        let _ = self.output.send(line.into());
    }
}

fn render_message(message: &MessageEvent) -> String {
    let author = if message.is_own {
        format!("{} (you)", message.author)
    } else {
        message.author.clone()
    };
    format!(
        "[{}] #{} {author}: {}",
        Local::now().format("%H:%M:%S"),
        message.sequence_id,
        message.content
    )
}

#[derive(Debug, PartialEq, Eq)]
enum Input<'a> {
    Empty,
    Quit,
    Nick(&'a str),
    Message(&'a str),
    Unknown,
}

fn parse_input(line: &str) -> Input<'_> {
    let trimmed = line.trim();
    if trimmed.is_empty() {
        return Input::Empty;
    }
    if trimmed == "/quit" {
        return Input::Quit;
    }
    if let Some(name) = trimmed.strip_prefix("/nick ") {
        let name = name.trim();
        return if name.is_empty() {
            Input::Unknown
        } else {
            Input::Nick(name)
        };
    }
    if trimmed.starts_with('/') {
        return Input::Unknown;
    }
    Input::Message(line.trim_end())
}

/// Runs the interactive client until `/quit` or end of input.
///
/// # Errors
/// Returns an error if the server URL or the state file is unusable.
pub async fn handle_chat(args: ChatArgs) -> Result<()> {
    let base = parse_server(&args.server)?;
    let state_path = args.state_file.unwrap_or_else(state::default_path);
    let mut initial = ClientState::load(&state_path)?.for_server(&base);
    if let Some(nickname) = args.nickname {
        initial.nickname = Some(nickname);
    }
    let state = Arc::new(Mutex::new(initial));

    let api = Api::new(base)?;
    let (connection_tx, mut connection_rx) = watch::channel(None);
    let (output_tx, mut output_rx) = mpsc::unbounded_channel::<String>();

    let printer = tokio::spawn(async move {
        while let Some(line) = output_rx.recv().await {
            println!("{line}");
        }
    });
    let follower = tokio::spawn(
        Follower::new(
            api.clone(),
            Arc::clone(&state),
            state_path.clone(),
            connection_tx,
            output_tx.clone(),
        )
        .run(),
    );

    let mut lines = BufReader::new(tokio::io::stdin()).lines();
    while let Some(line) = lines.next_line().await.context("reading input")? {
        match parse_input(&line) {
            Input::Empty => {}
            Input::Quit => break,
            Input::Unknown => {
                let _ = output_tx.send("[commands: /nick NAME, /quit]".to_string());
            }
            Input::Nick(name) => {
                let current = *connection_rx.borrow();
                let result = match current {
                    Some(id) => api.rename(id, name).await,
                    None => Err(anyhow!("not connected")),
                };
                match result {
                    Ok(event) => {
                        let mut state = state.lock().await;
                        state.nickname = Some(event.nickname);
                        if let Err(err) = state.save(&state_path) {
                            let _ = output_tx
                                .send(format!("[could not save client state: {err:#}]"));
                        }
                    }
                    Err(err) => {
                        let _ = output_tx.send(format!("[nickname not changed: {err:#}]"));
                    }
                }
            }
            Input::Message(content) => {
                if let Err(err) = publish_with_retry(
                    &api,
                    &mut connection_rx,
                    content.to_string(),
                    RetryPolicy::default(),
                )
                .await
                {
                    let _ = output_tx.send(format!("[{err:#}]"));
                }
            }
        }
    }

    follower.abort();
    drop(output_tx);
    let _ = printer.await;
    Ok(())
}
