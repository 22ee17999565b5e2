use itertools::Itertools;
use std::io::{self, Write};
use word_webs::*;

// ---------- Input handling ----------

fn read_line() -> Option<String> {
    let mut input = String::new();
    io::stdout().flush().ok()?;
    match io::stdin().read_line(&mut input) {
        Ok(0) | Err(_) => None,
        Ok(_) => Some(input.trim().to_string()),
    }
}

fn print_help() {
    println!();
    println!("Usage:");
    println!("  Pick the word you think is the day's target, by word or by number.");
    println!("  Your first pick from the grid ends the round:");
    println!("    100% = the target itself");
    println!("     50% = a near word");
    println!("      0% = a far word");
    println!("  After the round, pick any word to see its chain to the target.");
    println!();
    println!("  Commands:");
    println!("    q = quit");
    println!("    ? = show this help");
    println!("    c = print your shareable score");
}

/// `PUZZLE` may be a bare number or a page URL carrying one.
fn parse_puzzle_arg(arg: &str) -> Option<u64> {
    arg.parse().ok().or_else(|| puzzle_override(arg))
}

/// A grid number picks that cell; anything else is taken as the word itself,
/// case intact.
fn resolve_pick(game: &Game, input: String) -> String {
    match input.parse::<usize>() {
        Ok(n) if (1..=game.words().len()).contains(&n) => game.words()[n - 1].clone(),
        _ => input,
    }
}

// ---------- Display ----------

fn display_grid(game: &Game) {
    for row in &game.cells().into_iter().enumerate().chunks(3) {
        let line = row
            .map(|(i, cell)| {
                let mark = match (cell.class, cell.on_path) {
                    ("unguessed", _) => " ",
                    ("exact", _) => "*",
                    (_, true) => "+",
                    ("near", false) => "~",
                    _ => " ",
                };
                format!("{:>2}. {}{:<14}", i + 1, mark, cell.word)
            })
            .join(" ");
        println!("  {}", line.trim_end());
    }
}

fn display_result(game: &Game) {
    let response = game.response();
    println!();
    println!("Your guess: {}", response.word);
    println!("Your score: {}", response.score_percent());
    display_chain(game);
}

fn display_chain(game: &Game) {
    let info = game.info();
    println!();
    println!("Shortest chain for {}:", info.word);
    for segment in info.chain.segments() {
        match &segment.link {
            Some(link) => println!("  - {}  --{}-->", segment.definition, link),
            None => println!("  - {}", segment.definition),
        }
    }
}

// ---------- Main ----------

fn main() {
    init_tracing("warn");

    let mut args = std::env::args().skip(1);
    let config = Config::from_args(args.next());
    let override_index = args.next().as_deref().and_then(parse_puzzle_arg);

    println!("=== Word Webs ===");
    println!("Loading word data from {}...", config.data);

    let puzzles = match load_puzzles(&config.data) {
        Ok(p) => p,
        Err(e) => {
            eprintln!("{}", e);
            std::process::exit(1);
        }
    };

    let mut game = Game::new();
    let index = match game.load_today(&puzzles, override_index, &mut rand::rng()) {
        Ok(i) => i,
        Err(e) => {
            eprintln!("{}", e);
            std::process::exit(1);
        }
    };

    println!("Puzzle {} of {}. Which word is the target?\n", index + 1, puzzles.len());
    display_grid(&game);

    loop {
        println!();
        print!("Your pick (or 'q' to quit, '?' for help): ");
        let Some(input) = read_line() else {
            break;
        };
        match input.to_lowercase().as_str() {
            "q" => break,
            "?" => {
                print_help();
                continue;
            }
            "c" => {
                if game.is_ended() {
                    println!("{}", game.summary_glyphs());
                } else {
                    println!("Pick a word first.");
                }
                continue;
            }
            _ => {}
        }

        let word = resolve_pick(&game, input);

        let was_ended = game.is_ended();
        let outcome = game.guess(&word);

        if game.entry(&word).is_none() {
            println!("'{}' is not in today's grid.", outcome.word);
            continue;
        }
        if was_ended {
            display_chain(&game);
        } else {
            display_result(&game);
            println!();
            display_grid(&game);
            println!();
            println!("Type 'c' for your shareable score, or pick any word to see its chain.");
        }
    }
}
