use askama::Template;
use askama_web::WebTemplate;
use axum::{
    extract::{RawQuery, State},
    http::{header, HeaderMap},
    response::{IntoResponse, Response},
    routing::{get, post},
    Form, Router,
};
use chrono::{DateTime, Local};
use serde::Deserialize;
use std::{
    collections::HashMap,
    sync::{Arc, RwLock},
};
use tracing::{error, info, warn};
use uuid::Uuid;
use word_webs::*;

// ---------- App state ----------

struct PuzzleData {
    puzzles: Vec<Puzzle>,
    loaded_at: DateTime<Local>,
    load_error: Option<String>,
}

struct AppState {
    source: DataSource,
    puzzle_data: RwLock<PuzzleData>,
    sessions: RwLock<HashMap<String, Session>>,
}

struct Session {
    game: Game,
    selection: u64,
}

impl Session {
    fn new(puzzles: &[Puzzle], selection: u64) -> Self {
        let mut game = Game::new();
        if let Err(e) = game.load(puzzles, selection, &mut rand::rng()) {
            warn!("Session started without a puzzle: {}", e);
        }
        Self { game, selection }
    }
}

type SharedState = Arc<AppState>;

fn load_puzzle_data(source: &DataSource) -> PuzzleData {
    match load_puzzles(source) {
        Ok(puzzles) => PuzzleData {
            puzzles,
            loaded_at: Local::now(),
            load_error: None,
        },
        Err(e) => {
            error!("{}", e);
            PuzzleData {
                puzzles: Vec::new(),
                loaded_at: Local::now(),
                load_error: Some(e.to_string()),
            }
        }
    }
}

// ---------- Template data structs ----------

struct CellData {
    word: String,
    class: String,
    on_path: bool,
}

struct SegmentData {
    definition: String,
    link: String,
}

struct BoardView {
    loaded: bool,
    ended: bool,
    rejected_word: String,
    guess_word: String,
    score_percent: String,
    chain_word: String,
    segments: Vec<SegmentData>,
    cells: Vec<CellData>,
}

fn build_board(game: &Game) -> BoardView {
    let response = game.response();
    let info = game.info();
    let rejected_word = if !response.accepted && !response.word.is_empty() {
        response.word.clone()
    } else {
        String::new()
    };

    BoardView {
        loaded: game.is_loaded(),
        ended: game.is_ended(),
        rejected_word,
        guess_word: response.word.clone(),
        score_percent: response.score_percent(),
        chain_word: info.word.clone(),
        segments: info
            .chain
            .segments()
            .iter()
            .map(|s| SegmentData {
                definition: s.definition.clone(),
                link: s.link.clone().unwrap_or_default(),
            })
            .collect(),
        cells: game
            .cells()
            .into_iter()
            .map(|c| CellData {
                word: c.word.to_string(),
                class: c.class.to_string(),
                on_path: c.on_path,
            })
            .collect(),
    }
}

// ---------- Templates ----------

#[derive(Template, WebTemplate)]
#[template(path = "game.html")]
struct GameTemplate {
    board: BoardView,
    puzzle_number: usize,
    puzzle_count: usize,
    load_error: String,
    data_loaded_at: String,
}

#[derive(Template, WebTemplate)]
#[template(path = "partials/board.html")]
struct BoardTemplate {
    board: BoardView,
}

#[derive(Template, WebTemplate)]
#[template(path = "partials/reload_status.html")]
struct ReloadStatusTemplate {
    success: bool,
    message: String,
}

// ---------- Session helpers ----------

fn get_session_id(headers: &HeaderMap) -> Option<String> {
    headers
        .get(header::COOKIE)?
        .to_str()
        .ok()?
        .split(';')
        .find_map(|cookie| {
            let cookie = cookie.trim();
            cookie.strip_prefix("session=").map(|v| v.to_string())
        })
}

fn set_session_cookie(session_id: &str) -> (header::HeaderName, String) {
    (
        header::SET_COOKIE,
        format!("session={}; Path=/; SameSite=Lax", session_id),
    )
}

/// Applies the page's `?N` / `?puzzle=N` override, if any, to today's date.
fn selection_for(query: Option<&str>) -> u64 {
    let override_index = query.and_then(|q| puzzle_override(&format!("?{}", q)));
    choose_puzzle_index(today(), override_index)
}

/// Returns the id of the session to use. A browser id is reused only when
/// the server knows it; otherwise a fresh v4 id is minted. With a
/// `selection`, a known session playing another puzzle gets a new game.
fn session_for(
    sessions: &mut HashMap<String, Session>,
    puzzles: &[Puzzle],
    session_id: Option<String>,
    selection: Option<u64>,
) -> String {
    match session_id.filter(|id| sessions.contains_key(id)) {
        Some(id) => {
            if let Some(selection) = selection {
                if sessions.get(&id).is_some_and(|s| s.selection != selection) {
                    sessions.insert(id.clone(), Session::new(puzzles, selection));
                }
            }
            id
        }
        None => {
            let id = Uuid::new_v4().to_string();
            let selection = selection.unwrap_or_else(|| selection_for(None));
            sessions.insert(id.clone(), Session::new(puzzles, selection));
            id
        }
    }
}

fn with_session_cookie(mut response: Response, session_id: &str) -> Response {
    let (name, value) = set_session_cookie(session_id);
    response.headers_mut().insert(name, value.parse().unwrap());
    response
}

// ---------- Handlers ----------

async fn index(
    State(state): State<SharedState>,
    headers: HeaderMap,
    RawQuery(query): RawQuery,
) -> Response {
    let selection = selection_for(query.as_deref());

    let (session_id_out, board, puzzle_number, puzzle_count, load_error, loaded_at) = {
        let puzzle_data = state.puzzle_data.read().unwrap();
        let mut sessions = state.sessions.write().unwrap();

        let sid = session_for(
            &mut sessions,
            &puzzle_data.puzzles,
            get_session_id(&headers),
            Some(selection),
        );

        let session = sessions.get(&sid).unwrap();
        (
            sid.clone(),
            build_board(&session.game),
            session.game.puzzle_index().map_or(0, |i| i + 1),
            puzzle_data.puzzles.len(),
            puzzle_data.load_error.clone().unwrap_or_default(),
            puzzle_data.loaded_at.format("%Y-%m-%d %H:%M").to_string(),
        )
    };

    let template = GameTemplate {
        board,
        puzzle_number,
        puzzle_count,
        load_error,
        data_loaded_at: loaded_at,
    };

    with_session_cookie(template.into_response(), &session_id_out)
}

#[derive(Deserialize)]
struct GuessForm {
    word: String,
}

async fn submit_guess(
    State(state): State<SharedState>,
    headers: HeaderMap,
    Form(form): Form<GuessForm>,
) -> Response {
    let (session_id, board) = {
        let puzzle_data = state.puzzle_data.read().unwrap();
        let mut sessions = state.sessions.write().unwrap();
        let sid = session_for(
            &mut sessions,
            &puzzle_data.puzzles,
            get_session_id(&headers),
            None,
        );

        let session = sessions.get_mut(&sid).unwrap();
        session.game.guess(&form.word);
        (sid.clone(), build_board(&session.game))
    };

    with_session_cookie(BoardTemplate { board }.into_response(), &session_id)
}

async fn summary(State(state): State<SharedState>, headers: HeaderMap) -> Response {
    let session_id = get_session_id(&headers).unwrap_or_default();
    let glyphs = state
        .sessions
        .read()
        .unwrap()
        .get(&session_id)
        .map(|s| s.game.summary_glyphs())
        .unwrap_or_default();

    (
        [(header::CONTENT_TYPE, "text/plain; charset=utf-8")],
        glyphs,
    )
        .into_response()
}

async fn reload_data(State(state): State<SharedState>) -> Response {
    info!("Reloading word data...");

    let source = state.source.clone();
    let new_data = match tokio::task::spawn_blocking(move || load_puzzle_data(&source)).await {
        Ok(data) => data,
        Err(e) => {
            return ReloadStatusTemplate {
                success: false,
                message: format!("Reload failed: {}", e),
            }
            .into_response();
        }
    };

    if let Some(e) = new_data.load_error {
        return ReloadStatusTemplate {
            success: false,
            message: format!("Reload failed: {}", e),
        }
        .into_response();
    }

    let count = new_data.puzzles.len();

    {
        let mut puzzle_data = state.puzzle_data.write().unwrap();
        *puzzle_data = new_data;
    }
    {
        let mut sessions = state.sessions.write().unwrap();
        sessions.clear();
    }

    info!(puzzles = count, "Reload complete");

    ReloadStatusTemplate {
        success: true,
        message: format!("Reloaded. {} puzzles available.", count),
    }
    .into_response()
}

// ---------- Main ----------

#[tokio::main]
async fn main() {
    init_tracing("info");

    let config = Config::from_args(std::env::args().skip(1));
    info!(source = %config.data, "Word Webs - loading word data");

    let source = config.data.clone();
    let puzzle_data = tokio::task::spawn_blocking(move || load_puzzle_data(&source))
        .await
        .expect("Failed to load word data");

    let state = Arc::new(AppState {
        source: config.data,
        puzzle_data: RwLock::new(puzzle_data),
        sessions: RwLock::new(HashMap::new()),
    });

    let app = Router::new()
        .route("/", get(index))
        .route("/guess", post(submit_guess))
        .route("/summary", get(summary))
        .route("/reload", post(reload_data))
        .with_state(state);

    info!("Server running at http://{}", config.bind_addr);

    let listener = tokio::net::TcpListener::bind(config.bind_addr.as_str())
        .await
        .unwrap();
    axum::serve(listener, app).await.unwrap();
}

#[cfg(test)]
mod tests {
    use super::*;
    use axum::http::HeaderValue;

    fn test_state() -> SharedState {
        let puzzles = parse_puzzles(
            r#"[
                [{"w":"cat","s":2,"d":"cat"},{"w":"dog","s":0,"d":"cat-(is a)->dog"}],
                [{"w":"owl","s":2,"d":"owl"},{"w":"bat","s":1,"d":"bat-(flies like)->owl"}]
            ]"#,
        )
        .unwrap();
        Arc::new(AppState {
            source: DataSource::File("webs.json".into()),
            puzzle_data: RwLock::new(PuzzleData {
                puzzles,
                loaded_at: Local::now(),
                load_error: None,
            }),
            sessions: RwLock::new(HashMap::new()),
        })
    }

    fn cookie_headers(session_id: &str) -> HeaderMap {
        let mut headers = HeaderMap::new();
        headers.insert(
            header::COOKIE,
            format!("session={}", session_id).parse().unwrap(),
        );
        headers
    }

    fn cookie_session_id(response: &Response) -> String {
        let cookie = response
            .headers()
            .get(header::SET_COOKIE)
            .unwrap()
            .to_str()
            .unwrap();
        let mut headers = HeaderMap::new();
        headers.insert(header::COOKIE, cookie.parse().unwrap());
        get_session_id(&headers).unwrap()
    }

    async fn body_text(response: Response) -> String {
        let bytes = axum::body::to_bytes(response.into_body(), usize::MAX)
            .await
            .unwrap();
        String::from_utf8(bytes.to_vec()).unwrap()
    }

    fn guess_form(word: &str) -> Form<GuessForm> {
        Form(GuessForm {
            word: word.to_string(),
        })
    }

    fn puzzles() -> Vec<Puzzle> {
        parse_puzzles(r#"[[{"w":"cat","s":2,"d":"cat"},{"w":"dog","s":0,"d":"cat-(is a)->dog"}]]"#)
            .unwrap()
    }

    #[test]
    fn reads_session_cookie() {
        let mut headers = HeaderMap::new();
        headers.insert(
            header::COOKIE,
            HeaderValue::from_static("theme=dark; session=abc-123"),
        );
        assert_eq!(get_session_id(&headers), Some("abc-123".to_string()));
        assert_eq!(get_session_id(&HeaderMap::new()), None);
    }

    #[test]
    fn query_override_selects_puzzle() {
        assert_eq!(selection_for(Some("42")), 42);
        assert_eq!(selection_for(Some("puzzle=7")), 7);
        assert_eq!(selection_for(Some("x=1")), day_number(today()));
        assert_eq!(selection_for(None), day_number(today()));
    }

    #[test]
    fn board_before_and_after_end() {
        let mut session = Session::new(&puzzles(), 0);
        let board = build_board(&session.game);
        assert!(board.loaded && !board.ended);
        assert_eq!(board.cells.len(), 2);
        assert!(board.cells.iter().all(|c| c.class == "unguessed"));

        session.game.guess("owl");
        assert_eq!(build_board(&session.game).rejected_word, "owl");

        session.game.guess("dog");
        let board = build_board(&session.game);
        assert!(board.ended);
        assert_eq!(board.score_percent, "0%");
        assert_eq!(board.rejected_word, "");
        assert_eq!(board.chain_word, "dog");
        assert_eq!(board.segments.len(), 2);
        assert_eq!(board.segments[0].link, "is a");
    }

    #[test]
    fn session_without_data_rejects_guesses() {
        let mut session = Session::new(&[], 3);
        session.game.guess("cat");
        let board = build_board(&session.game);
        assert!(!board.loaded && !board.ended);
        assert!(board.cells.is_empty());
    }

    #[tokio::test]
    async fn unknown_cookie_gets_fresh_session() {
        let state = test_state();
        let response = index(
            State(state.clone()),
            cookie_headers("chosen-by-client"),
            RawQuery(None),
        )
        .await;

        let sid = cookie_session_id(&response);
        assert_ne!(sid, "chosen-by-client");
        assert!(Uuid::parse_str(&sid).is_ok());
        let sessions = state.sessions.read().unwrap();
        assert!(!sessions.contains_key("chosen-by-client"));
        assert!(sessions.contains_key(&sid));
    }

    #[tokio::test]
    async fn cookieless_guesses_do_not_share_a_game() {
        let state = test_state();
        let first = submit_guess(State(state.clone()), HeaderMap::new(), guess_form("dog")).await;
        let second =
            submit_guess(State(state.clone()), HeaderMap::new(), guess_form("owl")).await;

        let first_id = cookie_session_id(&first);
        let second_id = cookie_session_id(&second);
        assert_ne!(first_id, second_id);

        let sessions = state.sessions.read().unwrap();
        assert!(!sessions.contains_key(""));
        assert_eq!(sessions.len(), 2);
    }

    #[tokio::test]
    async fn guess_keeps_known_session() {
        let state = test_state();
        let page = index(State(state.clone()), HeaderMap::new(), RawQuery(Some("0".into()))).await;
        let sid = cookie_session_id(&page);

        let response = submit_guess(State(state.clone()), cookie_headers(&sid), guess_form("cat")).await;
        assert_eq!(cookie_session_id(&response), sid);

        let sessions = state.sessions.read().unwrap();
        assert_eq!(sessions.len(), 1);
        assert!(sessions[&sid].game.is_ended());
        assert_eq!(sessions[&sid].game.response().score, 100);
    }

    #[tokio::test]
    async fn changed_selection_replaces_game() {
        let state = test_state();
        let page = index(State(state.clone()), HeaderMap::new(), RawQuery(Some("1".into()))).await;
        let sid = cookie_session_id(&page);

        submit_guess(State(state.clone()), cookie_headers(&sid), guess_form("owl")).await;
        assert!(state.sessions.read().unwrap()[&sid].game.is_ended());

        let page = index(State(state.clone()), cookie_headers(&sid), RawQuery(Some("1".into()))).await;
        assert_eq!(cookie_session_id(&page), sid);
        assert!(state.sessions.read().unwrap()[&sid].game.is_ended());

        let page = index(State(state.clone()), cookie_headers(&sid), RawQuery(Some("2".into()))).await;
        assert_eq!(cookie_session_id(&page), sid);

        let sessions = state.sessions.read().unwrap();
        let session = &sessions[&sid];
        assert_eq!(session.selection, 2);
        assert_eq!(session.game.puzzle_index(), Some(0));
        assert!(!session.game.is_ended());
        assert!(!session.game.response().accepted);
    }

    #[tokio::test]
    async fn summary_returns_glyphs_after_end() {
        let state = test_state();
        let page = index(State(state.clone()), HeaderMap::new(), RawQuery(Some("0".into()))).await;
        let sid = cookie_session_id(&page);

        let before = summary(State(state.clone()), cookie_headers(&sid)).await;
        assert_eq!(body_text(before).await, "");

        submit_guess(State(state.clone()), cookie_headers(&sid), guess_form("cat")).await;
        let after = summary(State(state.clone()), cookie_headers(&sid)).await;
        assert_eq!(
            after.headers().get(header::CONTENT_TYPE).unwrap(),
            "text/plain; charset=utf-8"
        );
        assert_eq!(body_text(after).await, "🟪🕷");

        let stranger = summary(State(state.clone()), HeaderMap::new()).await;
        assert_eq!(body_text(stranger).await, "");
    }
}
