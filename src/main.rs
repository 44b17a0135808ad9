use crossterm::{
    cursor::{Hide, Show},
    event::{self, Event, KeyCode, KeyEvent, KeyEventKind, KeyModifiers},
    execute,
    terminal::{disable_raw_mode, enable_raw_mode, EnterAlternateScreen, LeaveAlternateScreen},
};
use log::{debug, error, info};
use rand::{rngs::ThreadRng, Rng};
use ratatui::{
    backend::{Backend, CrosstermBackend},
    buffer::Buffer,
    layout::Rect,
    style::Color,
    widgets::Widget,
    Terminal,
};
use simplelog::{Config, LevelFilter, WriteLogger};
use std::collections::VecDeque;
use std::fs::File;
use std::io;
use std::thread;
use std::time::{Duration, Instant};

const LOG_FILE: &str = "gridsnake.log";

fn main() -> Result<(), io::Error> {
    // Set up logging before anything else
    WriteLogger::init(LevelFilter::Info, Config::default(), File::create(LOG_FILE)?)
        .expect("Failed to initialize logger");

    let config = GameConfig::default();
    config.validate()?;
    info!("Starting gridsnake with {:?}", config);

    // Setup terminal
    enable_raw_mode()?;
    let mut stdout = io::stdout();
    execute!(stdout, EnterAlternateScreen, Hide)?;
    let backend = CrosstermBackend::new(stdout);
    let mut terminal = Terminal::new(backend)?;

    let result = run(&mut terminal, config);

    // Cleanup terminal, even if the game loop failed
    disable_raw_mode()?;
    execute!(terminal.backend_mut(), LeaveAlternateScreen, Show)?;

    if let Err(e) = &result {
        error!("Game loop failed: {}", e);
    }
    info!("Shutting down");

    result
}

fn run<B: Backend>(terminal: &mut Terminal<B>, config: GameConfig) -> io::Result<()> {
    let mut surface = Surface::new(&config);
    let mut clock = Clock::new(config.tick_rate);
    let mut game = Game::new(config);

    while game.is_running() {
        clock.tick();
        drain_input(&mut game)?;
        if !game.is_running() {
            break;
        }

        match game.update() {
            StepResult::Ate => debug!("Food eaten, snake length now {}", game.snake.length),
            StepResult::Collision | StepResult::Ongoing => {}
        }

        game.draw(&mut surface);
        terminal.draw(|frame| frame.render_widget(&surface, frame.area()))?;
    }

    Ok(())
}

/// Handles every event queued since the last tick without blocking.
fn drain_input<R: Rng>(game: &mut Game<R>) -> io::Result<()> {
    while game.is_running() && event::poll(Duration::ZERO)? {
        if let Event::Key(key) = event::read()? {
            game.handle_input(key);
        }
    }
    Ok(())
}

/// Fixed settings for one run of the game. Dimensions are in pixels.
#[derive(Clone, Debug, PartialEq)]
struct GameConfig {
    screen_width: u16,
    screen_height: u16,
    cell_size: u16,
    /// Ticks per second.
    tick_rate: u32,
    background_color: Color,
    border_color: Color,
    snake_color: Color,
    food_color: Color,
}

impl Default for GameConfig {
    fn default() -> Self {
        GameConfig {
            screen_width: 640,
            screen_height: 480,
            cell_size: 20,
            tick_rate: 20,
            background_color: Color::Rgb(0, 0, 0),
            border_color: Color::Rgb(153, 102, 204),
            snake_color: Color::Rgb(0, 255, 0),
            food_color: Color::Rgb(255, 0, 0),
        }
    }
}

impl GameConfig {
    fn validate(&self) -> io::Result<()> {
        if self.cell_size == 0 {
            return Err(invalid_config("cell_size must be positive".to_string()));
        }
        if self.tick_rate == 0 {
            return Err(invalid_config("tick_rate must be positive".to_string()));
        }
        for (name, value) in [
            ("screen_width", self.screen_width),
            ("screen_height", self.screen_height),
        ] {
            if value == 0 || value % self.cell_size != 0 {
                return Err(invalid_config(format!(
                    "{} ({}) must be a positive multiple of cell_size ({})",
                    name, value, self.cell_size
                )));
            }
        }
        Ok(())
    }

    fn size(&self) -> Size {
        Size {
            width: self.screen_width,
            height: self.screen_height,
        }
    }

    fn cols(&self) -> u16 {
        self.screen_width / self.cell_size
    }

    fn rows(&self) -> u16 {
        self.screen_height / self.cell_size
    }

    /// Screen centre, snapped down onto the grid.
    fn start_position(&self) -> Pos {
        Pos {
            x: self.cols() / 2 * self.cell_size,
            y: self.rows() / 2 * self.cell_size,
        }
    }
}

fn invalid_config(msg: String) -> io::Error {
    io::Error::new(io::ErrorKind::InvalidInput, msg)
}

/// Blocks the caller so that ticks happen at a fixed rate.
#[derive(Debug)]
struct Clock {
    period: Duration,
    last_tick: Option<Instant>,
}

impl Clock {
    fn new(tick_rate: u32) -> Self {
        Clock {
            period: Duration::from_secs(1) / tick_rate,
            last_tick: None,
        }
    }

    fn remaining(&self, now: Instant) -> Duration {
        match self.last_tick {
            Some(last) => self.period.saturating_sub(now.duration_since(last)),
            None => Duration::ZERO,
        }
    }

    /// Waits for the next tick boundary and returns the time since the previous one.
    fn tick(&mut self) -> Duration {
        let wait = self.remaining(Instant::now());
        if !wait.is_zero() {
            thread::sleep(wait);
        }

        let now = Instant::now();
        let elapsed = self
            .last_tick
            .map_or(Duration::ZERO, |last| now.duration_since(last));
        self.last_tick = Some(now);
        elapsed
    }
}

#[derive(Clone, Copy, Debug, Default, PartialEq)]
struct Size {
    width: u16,
    height: u16,
}

#[derive(Clone, Copy, Debug, PartialEq)]
enum Direction {
    Up,
    Down,
    Left,
    Right,
}

impl Direction {
    fn opposite(&self) -> Direction {
        match self {
            Direction::Up => Direction::Down,
            Direction::Down => Direction::Up,
            Direction::Left => Direction::Right,
            Direction::Right => Direction::Left,
        }
    }
}

#[derive(Clone, Copy, Debug, PartialEq)]
struct Pos {
    x: u16,
    y: u16,
}

#[derive(Clone, Copy, Debug, PartialEq)]
struct PosDelta {
    x: i32,
    y: i32,
}

impl From<Direction> for PosDelta {
    fn from(dir: Direction) -> Self {
        match dir {
            Direction::Up => PosDelta { x: 0, y: -1 },
            Direction::Down => PosDelta { x: 0, y: 1 },
            Direction::Left => PosDelta { x: -1, y: 0 },
            Direction::Right => PosDelta { x: 1, y: 0 },
        }
    }
}

impl PosDelta {
    fn scaled(self, factor: u16) -> PosDelta {
        PosDelta {
            x: self.x * factor as i32,
            y: self.y * factor as i32,
        }
    }
}

impl Pos {
    fn wrapped_add(&self, delta: PosDelta, size: Size) -> Pos {
        let new_x = (self.x as i32 + delta.x).rem_euclid(size.width as i32) as u16;
        let new_y = (self.y as i32 + delta.y).rem_euclid(size.height as i32) as u16;
        Pos { x: new_x, y: new_y }
    }
}

#[derive(Debug, PartialEq)]
enum StepResult {
    Ongoing,   // Normal movement
    Ate,       // Head landed on the food, snake grew
    Collision, // Hit own body, snake was reset
}

#[derive(Debug)]
struct Snake {
    /// Head first.
    segments: VecDeque<Pos>,
    length: usize,
    direction: Direction,
    pending_direction: Option<Direction>,
    /// Cells left behind since the last draw.
    removed: Vec<Pos>,
    start: Pos,
    cell_size: u16,
    arena: Size,
}

impl Snake {
    fn new(start: Pos, cell_size: u16, arena: Size) -> Self {
        Snake {
            segments: VecDeque::from([start]),
            length: 1,
            direction: Direction::Right,
            pending_direction: None,
            removed: Vec::new(),
            start,
            cell_size,
            arena,
        }
    }

    fn head(&self) -> Pos {
        self.segments[0]
    }

    /// Buffers a turn for the next tick. Reversing onto the neck is refused.
    fn steer(&mut self, new_direction: Direction) -> bool {
        if new_direction == self.direction.opposite() {
            return false;
        }
        self.pending_direction = Some(new_direction);
        true
    }

    fn update_direction(&mut self) {
        if let Some(direction) = self.pending_direction.take() {
            self.direction = direction;
        }
    }

    fn slither(&mut self) -> StepResult {
        let delta = PosDelta::from(self.direction).scaled(self.cell_size);
        let new_head = self.head().wrapped_add(delta, self.arena);

        // The head and neck can't be bitten
        if self.segments.iter().skip(2).any(|pos| *pos == new_head) {
            info!("Snake hit itself at length {}, resetting", self.length);
            self.reset();
            return StepResult::Collision;
        }

        self.segments.push_front(new_head);
        if self.segments.len() > self.length {
            if let Some(tail) = self.segments.pop_back() {
                self.removed.push(tail);
            }
        }

        StepResult::Ongoing
    }

    fn grow(&mut self) {
        self.length += 1;
    }

    fn reset(&mut self) {
        self.removed.extend(self.segments.drain(..));
        self.segments.push_back(self.start);
        self.length = 1;
        self.direction = Direction::Right;
        self.pending_direction = None;
    }
}

#[derive(Debug)]
struct Food {
    pos: Pos,
    cell_size: u16,
    arena: Size,
}

impl Food {
    fn new(config: &GameConfig, rng: &mut impl Rng) -> Self {
        let mut food = Food {
            pos: Pos { x: 0, y: 0 },
            cell_size: config.cell_size,
            arena: config.size(),
        };
        food.randomize_position(rng);
        food
    }

    /// Moves the food to a uniformly chosen cell. The snake is not avoided.
    fn randomize_position(&mut self, rng: &mut impl Rng) -> Pos {
        let cols = self.arena.width / self.cell_size;
        let rows = self.arena.height / self.cell_size;
        self.pos = Pos {
            x: rng.gen_range(0..cols) * self.cell_size,
            y: rng.gen_range(0..rows) * self.cell_size,
        };
        self.pos
    }
}

/// Something that cells can be painted onto.
trait Canvas {
    fn paint(&mut self, pos: Pos, fill: Color, border: Color);
    fn erase(&mut self, pos: Pos);
}

trait Draw {
    fn draw(&mut self, canvas: &mut impl Canvas, config: &GameConfig);
}

impl Draw for Snake {
    fn draw(&mut self, canvas: &mut impl Canvas, config: &GameConfig) {
        // Erase first so that a re-entered cell is painted again below
        for pos in self.removed.drain(..) {
            canvas.erase(pos);
        }
        for pos in &self.segments {
            canvas.paint(*pos, config.snake_color, config.border_color);
        }
    }
}

impl Draw for Food {
    fn draw(&mut self, canvas: &mut impl Canvas, config: &GameConfig) {
        canvas.paint(self.pos, config.food_color, config.border_color);
    }
}

#[derive(Clone, Copy, Debug, PartialEq)]
struct Tile {
    fill: Color,
    border: Option<Color>,
}

/// Persistent grid of painted cells, shown in the terminal two columns per cell.
#[derive(Debug)]
struct Surface {
    cell_size: u16,
    cols: u16,
    rows: u16,
    background: Color,
    tiles: Vec<Tile>,
}

impl Surface {
    fn new(config: &GameConfig) -> Self {
        let blank = Tile {
            fill: config.background_color,
            border: None,
        };
        Surface {
            cell_size: config.cell_size,
            cols: config.cols(),
            rows: config.rows(),
            background: config.background_color,
            tiles: vec![blank; config.cols() as usize * config.rows() as usize],
        }
    }

    fn index(&self, pos: Pos) -> Option<usize> {
        let col = pos.x / self.cell_size;
        let row = pos.y / self.cell_size;
        if col >= self.cols || row >= self.rows {
            return None;
        }
        Some(row as usize * self.cols as usize + col as usize)
    }

    #[cfg(test)]
    fn tile(&self, pos: Pos) -> Option<Tile> {
        self.index(pos).map(|i| self.tiles[i])
    }
}

impl Canvas for Surface {
    fn paint(&mut self, pos: Pos, fill: Color, border: Color) {
        if let Some(i) = self.index(pos) {
            self.tiles[i] = Tile {
                fill,
                border: Some(border),
            };
        }
    }

    fn erase(&mut self, pos: Pos) {
        if let Some(i) = self.index(pos) {
            self.tiles[i] = Tile {
                fill: self.background,
                border: None,
            };
        }
    }
}

impl Widget for &Surface {
    fn render(self, area: Rect, buf: &mut Buffer) {
        for row in 0..self.rows.min(area.height) {
            for col in 0..self.cols {
                let offset = col as u32 * 2;
                if offset + 1 >= area.width as u32 {
                    break;
                }
                let x = area.x + offset as u16;
                let y = area.y + row;

                let tile = self.tiles[row as usize * self.cols as usize + col as usize];
                let (left, right, fg) = match tile.border {
                    Some(border) => ("[", "]", border),
                    None => (" ", " ", tile.fill),
                };
                buf[(x, y)].set_symbol(left).set_fg(fg).set_bg(tile.fill);
                buf[(x + 1, y)].set_symbol(right).set_fg(fg).set_bg(tile.fill);
            }
        }
    }
}

#[derive(Clone, Copy, Debug, PartialEq)]
enum Command {
    Steer(Direction),
    Quit,
}

fn command_for(key: KeyEvent) -> Option<Command> {
    if key.kind != KeyEventKind::Press {
        return None;
    }
    if key.modifiers.contains(KeyModifiers::CONTROL) && key.code == KeyCode::Char('c') {
        return Some(Command::Quit);
    }

    match key.code {
        KeyCode::Up => Some(Command::Steer(Direction::Up)),
        KeyCode::Down => Some(Command::Steer(Direction::Down)),
        KeyCode::Left => Some(Command::Steer(Direction::Left)),
        KeyCode::Right => Some(Command::Steer(Direction::Right)),
        KeyCode::Esc | KeyCode::Char('q') => Some(Command::Quit),
        _ => None,
    }
}

struct Game<R: Rng> {
    config: GameConfig,
    snake: Snake,
    food: Food,
    rng: R,
    running: bool,
}

impl Game<ThreadRng> {
    fn new(config: GameConfig) -> Self {
        Self::with_rng(config, rand::thread_rng())
    }
}

impl<R: Rng> Game<R> {
    fn with_rng(config: GameConfig, mut rng: R) -> Self {
        let snake = Snake::new(config.start_position(), config.cell_size, config.size());
        let food = Food::new(&config, &mut rng);
        Game {
            config,
            snake,
            food,
            rng,
            running: true,
        }
    }

    fn is_running(&self) -> bool {
        self.running
    }

    fn handle_input(&mut self, key: KeyEvent) {
        match command_for(key) {
            Some(Command::Steer(direction)) => {
                self.snake.steer(direction);
            }
            Some(Command::Quit) => {
                info!("Quit requested");
                self.running = false;
            }
            None => {}
        }
    }

    fn update(&mut self) -> StepResult {
        self.snake.update_direction();
        let result = self.snake.slither();

        // A freshly reset head can still land on the food
        if self.snake.head() == self.food.pos {
            self.snake.grow();
            self.food.randomize_position(&mut self.rng);
            return StepResult::Ate;
        }

        result
    }

    fn draw(&mut self, canvas: &mut impl Canvas) {
        self.snake.draw(canvas, &self.config);
        self.food.draw(canvas, &self.config);
    }
}
