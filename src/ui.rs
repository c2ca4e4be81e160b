use askql::client::Transport;
use askql::transcript::{Message, Mode, Query, StreamingState};
use askql::{CancellationGovernor, ChatSession, RoundOutcome, SessionSnapshot};
use crossterm::cursor::MoveTo;
use crossterm::event::{self, Event, KeyCode, KeyModifiers};
use crossterm::execute;
use crossterm::terminal::{disable_raw_mode, enable_raw_mode, size};
use futures::StreamExt;
use ratatui::backend::CrosstermBackend;
use ratatui::style::{Color, Modifier, Style};
use ratatui::text::{Line, Span, Text};
use ratatui::widgets::{Block, Borders, Paragraph, Widget, Wrap};
use ratatui::{Frame, Terminal, TerminalOptions, Viewport};
use std::io;
use std::io::Write;
use std::time::Duration;
use tokio::sync::mpsc;
use tokio_stream::wrappers::WatchStream;
use tracing::debug;
use uuid::Uuid;

type TuiTerminal = Terminal<CrosstermBackend<io::Stdout>>;
type UiResult<T> = Result<T, Box<dyn std::error::Error + Send + Sync>>;

const INPUT_HEIGHT: u16 = 6;

// Restores terminal settings even if the loop exits early.
struct TerminalGuard;

impl Drop for TerminalGuard {
    fn drop(&mut self) {
        let _ = disable_raw_mode();
        let _ = io::stdout().flush();
    }
}

#[derive(Debug, Clone)]
enum ChatMessage {
    User(String),
    /// `header` is `None` when continuing a message already on screen.
    Assistant {
        header: Option<String>,
        content: String,
        pending: bool,
    },
    Info(String),
    Error(String),
}

#[derive(Debug, Clone)]
struct LineSpec {
    text: String,
    style: Style,
}

impl LineSpec {
    fn new(text: impl Into<String>, style: Style) -> Self {
        Self {
            text: text.into(),
            style,
        }
    }
}

impl ChatMessage {
    fn line_specs(&self) -> Vec<LineSpec> {
        match self {
            ChatMessage::User(msg) => {
                let header_style = Style::default()
                    .fg(Color::Blue)
                    .add_modifier(Modifier::BOLD);
                let body_style = Style::default().fg(Color::Blue);
                let mut lines = vec![LineSpec::new("You:", header_style)];
                for line in msg.lines() {
                    lines.push(LineSpec::new(format!("  {}", line), body_style));
                }
                lines
            }
            ChatMessage::Assistant {
                header,
                content,
                pending,
            } => {
                let header_style = Style::default()
                    .fg(Color::Yellow)
                    .add_modifier(Modifier::BOLD);
                let body_style = Style::default().fg(Color::Yellow);
                let mut lines = Vec::new();
                if let Some(header) = header {
                    lines.push(LineSpec::new(format!("{header}:"), header_style));
                }
                for line in content.lines() {
                    let trimmed = line.trim_start();
                    if trimmed.starts_with("<confirmation") && *pending {
                        lines.push(LineSpec::new(
                            "  [y] approve  [n] reject",
                            Style::default()
                                .fg(Color::Magenta)
                                .add_modifier(Modifier::BOLD),
                        ));
                    } else if trimmed.starts_with("<confirmation") {
                        lines.push(LineSpec::new(
                            "  (confirmation no longer pending)",
                            Style::default()
                                .fg(Color::DarkGray)
                                .add_modifier(Modifier::ITALIC),
                        ));
                    } else if trimmed.starts_with("**❌") {
                        lines.push(LineSpec::new(format!("  {}", line), Style::default().fg(Color::Red)));
                    } else {
                        lines.push(LineSpec::new(format!("  {}", line), body_style));
                    }
                }
                lines
            }
            ChatMessage::Info(msg) => vec![LineSpec::new(
                format!("ℹ {}", msg),
                Style::default()
                    .fg(Color::Gray)
                    .add_modifier(Modifier::ITALIC),
            )],
            ChatMessage::Error(msg) => vec![LineSpec::new(
                format!("✗ {}", msg),
                Style::default().fg(Color::Red),
            )],
        }
    }

    fn to_text(&self) -> Text<'static> {
        let lines = self
            .line_specs()
            .into_iter()
            .map(|spec| Line::from(Span::styled(spec.text, spec.style)))
            .collect::<Vec<_>>();
        Text::from(lines)
    }

    fn rendered_height(&self, width: u16) -> u16 {
        let width = width.max(1) as usize;
        let mut total = 0usize;
        for spec in self.line_specs() {
            let len = spec.text.chars().count().max(1);
            total += len.div_ceil(width);
        }
        total as u16
    }
}

/// Requests from the terminal loop to the task that owns the session.
#[derive(Debug)]
enum UiCommand {
    Send(Query),
    Resolve(bool),
    SetMode(Mode),
}

#[derive(Debug)]
enum UiEvent {
    Snapshot(SessionSnapshot),
    RoundEnded {
        outcome: Option<RoundOutcome>,
        error: Option<String>,
        message: Option<Message>,
    },
}

fn spawn_session<T: Transport + 'static>(
    mut session: ChatSession<T>,
    mut commands: mpsc::Receiver<UiCommand>,
    events: mpsc::Sender<UiEvent>,
) {
    let mut snapshots = WatchStream::new(session.subscribe());
    let snapshot_events = events.clone();
    tokio::spawn(async move {
        while let Some(snapshot) = snapshots.next().await {
            if snapshot_events.send(UiEvent::Snapshot(snapshot)).await.is_err() {
                break;
            }
        }
    });

    tokio::spawn(async move {
        while let Some(command) = commands.recv().await {
            let result = match command {
                UiCommand::Send(query) => session.send(query).await,
                UiCommand::Resolve(confirmed) => session.resolve(confirmed).await,
                UiCommand::SetMode(mode) => {
                    session.set_mode(mode);
                    continue;
                }
            };
            let (outcome, error) = match result {
                Ok(outcome) => (Some(outcome), None),
                Err(err) => (None, Some(err.to_string())),
            };
            let event = UiEvent::RoundEnded {
                outcome,
                error,
                message: session.conversation().active_message().cloned(),
            };
            if events.send(event).await.is_err() {
                break;
            }
        }
        debug!("session task finished");
    });
}

/// The lines of `current` not yet printed, given what was printed before.
/// A line that diverges part way is printed again in full.
fn unprinted<'a>(previous: &str, current: &'a str) -> &'a str {
    let mut common = 0;
    for ((idx, a), b) in current.char_indices().zip(previous.chars()) {
        if a != b {
            break;
        }
        common = idx + a.len_utf8();
    }
    if common == current.len() {
        return "";
    }
    let start = current[..common].rfind('\n').map_or(0, |idx| idx + 1);
    current[start..].trim_start_matches('\n')
}

/// Everything up to and including the last line break; a line still being
/// streamed is held back.
fn complete_lines(content: &str) -> &str {
    content.rfind('\n').map_or("", |idx| &content[..=idx])
}

struct InputBuffer {
    lines: Vec<String>,
    cursor_x: usize,
    cursor_y: usize,
}

impl InputBuffer {
    fn new() -> Self {
        Self {
            lines: vec![String::new()],
            cursor_x: 0,
            cursor_y: 0,
        }
    }

    fn clear(&mut self) {
        self.lines = vec![String::new()];
        self.cursor_x = 0;
        self.cursor_y = 0;
    }

    fn insert_char(&mut self, c: char) {
        let line = &mut self.lines[self.cursor_y];
        let at = byte_offset(line, self.cursor_x);
        line.insert(at, c);
        self.cursor_x += 1;
    }

    fn delete_char(&mut self) {
        if self.cursor_x > 0 {
            let line = &mut self.lines[self.cursor_y];
            let at = byte_offset(line, self.cursor_x - 1);
            line.remove(at);
            self.cursor_x -= 1;
        } else if self.cursor_y > 0 {
            let removed = self.lines.remove(self.cursor_y);
            self.cursor_y -= 1;
            self.cursor_x = self.lines[self.cursor_y].chars().count();
            self.lines[self.cursor_y].push_str(&removed);
        }
    }

    fn new_line(&mut self) {
        let line = &self.lines[self.cursor_y];
        let remaining: String = line.chars().skip(self.cursor_x).collect();
        self.lines[self.cursor_y] = line.chars().take(self.cursor_x).collect();
        self.lines.insert(self.cursor_y + 1, remaining);
        self.cursor_y += 1;
        self.cursor_x = 0;
    }

    fn move_left(&mut self) {
        if self.cursor_x > 0 {
            self.cursor_x -= 1;
        } else if self.cursor_y > 0 {
            self.cursor_y -= 1;
            self.cursor_x = self.lines[self.cursor_y].chars().count();
        }
    }

    fn move_right(&mut self) {
        let line_len = self.lines[self.cursor_y].chars().count();
        if self.cursor_x < line_len {
            self.cursor_x += 1;
        } else if self.cursor_y < self.lines.len() - 1 {
            self.cursor_y += 1;
            self.cursor_x = 0;
        }
    }

    fn text(&self) -> String {
        self.lines.join("\n")
    }

    fn is_empty(&self) -> bool {
        self.lines.iter().all(|l| l.is_empty())
    }

    fn render(&self) -> Text<'static> {
        if self.is_empty() {
            return Text::from(Span::styled(
                "Ask about your data; mention tables with @name...",
                Style::default().fg(Color::DarkGray),
            ));
        }
        Text::from(
            self.lines
                .iter()
                .map(|l| Line::from(l.clone()))
                .collect::<Vec<_>>(),
        )
    }
}

fn byte_offset(line: &str, chars: usize) -> usize {
    line.char_indices()
        .nth(chars)
        .map_or(line.len(), |(idx, _)| idx)
}

struct App {
    input: InputBuffer,
    should_quit: bool,
    commands: mpsc::Sender<UiCommand>,
    events: mpsc::Receiver<UiEvent>,
    governor: CancellationGovernor,
    mode: Mode,
    model: String,
    streaming: StreamingState,
    status: Option<String>,
    pending: bool,
    printed: Option<(Uuid, String)>,
}

impl App {
    fn title(&self) -> String {
        let mode = match self.mode {
            Mode::Ask => "ask",
            Mode::Agent => "agent",
        };
        let state = match (&self.streaming, &self.status) {
            (StreamingState::AwaitingConfirmation, _) => " [confirm: y/n]".to_string(),
            (StreamingState::Streaming { .. }, Some(status)) => format!(" [{status}]"),
            (StreamingState::Streaming { .. }, None) => " [Streaming...]".to_string(),
            (StreamingState::Idle, _) => String::new(),
        };
        format!(" {mode} (Enter send, Tab mode, Esc stop/quit){state} ")
    }

    fn draw(&mut self, f: &mut Frame) {
        let area = f.area();
        let input_paragraph = Paragraph::new(self.input.render())
            .block(
                Block::default()
                    .borders(Borders::ALL)
                    .title(self.title())
                    .border_style(Style::default().fg(Color::DarkGray)),
            )
            .wrap(Wrap { trim: false });

        f.render_widget(input_paragraph, area);

        let cursor_x = (self.input.cursor_x + 1) as u16;
        let cursor_y = self.input.cursor_y as u16;
        let x = (area.x + cursor_x).min(area.x + area.width - 2);
        let y = (area.y + 1 + cursor_y).min(area.y + area.height - 2);
        f.set_cursor_position((x, y));
    }

    fn append_message(&mut self, terminal: &mut TuiTerminal, message: ChatMessage) -> UiResult<()> {
        let width = terminal.size()?.width;
        let height = message.rendered_height(width).saturating_add(1);
        let mut text = message.to_text();
        text.extend(Text::raw("\n"));
        // Insert above the inline viewport so the log stays in scrollback.
        terminal.insert_before(height, |buf| {
            let paragraph = Paragraph::new(text).wrap(Wrap { trim: false });
            paragraph.render(buf.area, buf);
        })?;
        Ok(())
    }

    /// Prints whatever part of the assistant message has not been shown yet.
    /// While streaming only finished lines are printed.
    fn print_assistant(
        &mut self,
        terminal: &mut TuiTerminal,
        message: &Message,
        streaming: bool,
    ) -> UiResult<()> {
        let visible = if streaming {
            complete_lines(&message.content)
        } else {
            message.content.as_str()
        };
        let (continuation, previous) = match &self.printed {
            Some((id, text)) if *id == message.id => (true, text.as_str()),
            _ => (false, ""),
        };
        let fresh = unprinted(previous, visible).to_string();
        if fresh.trim().is_empty() {
            return Ok(());
        }
        self.printed = Some((message.id, visible.to_string()));

        let header = if continuation {
            None
        } else {
            Some(message.model.clone().unwrap_or_else(|| self.model.clone()))
        };
        let pending = self.pending;
        self.append_message(
            terminal,
            ChatMessage::Assistant {
                header,
                content: fresh,
                pending,
            },
        )
    }

    fn round_ended(
        &mut self,
        terminal: &mut TuiTerminal,
        outcome: Option<RoundOutcome>,
        error: Option<String>,
        message: Option<Message>,
    ) -> UiResult<()> {
        self.pending = matches!(outcome, Some(RoundOutcome::AwaitingConfirmation(_)));
        if let Some(message) = &message {
            self.print_assistant(terminal, message, false)?;
        }
        match outcome {
            Some(RoundOutcome::Cancelled) => {
                let dropped = message
                    .as_ref()
                    .is_some_and(|m| m.content.contains("<confirmation "));
                let note = if dropped {
                    "Stopped. The confirmation request was dropped."
                } else {
                    "Stopped."
                };
                self.append_message(terminal, ChatMessage::Info(note.to_string()))?;
            }
            Some(RoundOutcome::Rejected) => {
                self.append_message(
                    terminal,
                    ChatMessage::Info("Operation cancelled.".to_string()),
                )?;
            }
            Some(RoundOutcome::AwaitingConfirmation(op)) => {
                self.streaming = StreamingState::AwaitingConfirmation;
                self.append_message(
                    terminal,
                    ChatMessage::Info(format!("{} requires confirmation: {}", op.operation, op.explanation)),
                )?;
            }
            Some(RoundOutcome::Completed) | None => {}
        }
        if let Some(error) = error {
            // Errors already shown as part of the message are not repeated.
            let shown = message.is_some_and(|m| m.content.contains(&error));
            if !shown {
                self.append_message(terminal, ChatMessage::Error(error))?;
            }
        }
        Ok(())
    }

    fn command(&mut self, terminal: &mut TuiTerminal, command: UiCommand) -> UiResult<()> {
        if self.commands.try_send(command).is_err() {
            self.append_message(
                terminal,
                ChatMessage::Error("session is busy; try again".to_string()),
            )?;
        }
        Ok(())
    }

    fn handle_events(&mut self, terminal: &mut TuiTerminal) -> UiResult<bool> {
        while let Ok(event) = self.events.try_recv() {
            match event {
                UiEvent::Snapshot(snapshot) => {
                    self.streaming = snapshot.streaming;
                    self.status = snapshot.status;
                    self.pending = snapshot.pending.is_some();
                    if let Some(active) = &snapshot.active {
                        let streaming = matches!(snapshot.streaming, StreamingState::Streaming { .. });
                        self.print_assistant(terminal, active, streaming)?;
                    }
                }
                UiEvent::RoundEnded {
                    outcome,
                    error,
                    message,
                } => self.round_ended(terminal, outcome, error, message)?,
            }
        }

        if !event::poll(Duration::from_millis(50))? {
            return Ok(true);
        }
        let Event::Key(key) = event::read()? else {
            return Ok(true);
        };

        if key.modifiers.contains(KeyModifiers::CONTROL) && key.code == KeyCode::Char('c') {
            self.should_quit = true;
            return Ok(false);
        }

        let awaiting = self.streaming == StreamingState::AwaitingConfirmation;
        match key.code {
            KeyCode::Esc => match self.governor.stop() {
                Ok(true) => {}
                Ok(false) => {
                    self.should_quit = true;
                    return Ok(false);
                }
                Err(err) => self.append_message(terminal, ChatMessage::Info(err.to_string()))?,
            },
            KeyCode::Char(c @ ('y' | 'n')) if awaiting && self.input.is_empty() => {
                self.streaming = StreamingState::Streaming { round: 0 };
                self.command(terminal, UiCommand::Resolve(c == 'y'))?;
            }
            KeyCode::Tab if self.streaming == StreamingState::Idle => {
                self.mode = match self.mode {
                    Mode::Ask => Mode::Agent,
                    Mode::Agent => Mode::Ask,
                };
                self.command(terminal, UiCommand::SetMode(self.mode))?;
            }
            KeyCode::Enter if key.modifiers.contains(KeyModifiers::SHIFT) => {
                self.input.new_line();
            }
            KeyCode::Enter => {
                let text = self.input.text();
                if text.trim().is_empty() {
                    return Ok(true);
                }
                if self.streaming != StreamingState::Idle {
                    self.append_message(
                        terminal,
                        ChatMessage::Info("Wait for the current answer, or press Esc.".to_string()),
                    )?;
                    return Ok(true);
                }
                self.append_message(terminal, ChatMessage::User(text.clone()))?;
                self.input.clear();
                self.streaming = StreamingState::Streaming { round: 0 };
                self.command(terminal, UiCommand::Send(Query::parse(&text)))?;
            }
            KeyCode::Char(c) => self.input.insert_char(c),
            KeyCode::Backspace => self.input.delete_char(),
            KeyCode::Left => self.input.move_left(),
            KeyCode::Right => self.input.move_right(),
            _ => {}
        }

        Ok(true)
    }
}

pub fn run_tui<T: Transport + 'static>(session: ChatSession<T>) -> UiResult<()> {
    let (command_tx, command_rx) = mpsc::channel(16);
    let (event_tx, event_rx) = mpsc::channel(256);
    let mut app = App {
        input: InputBuffer::new(),
        should_quit: false,
        commands: command_tx,
        events: event_rx,
        governor: session.governor(),
        mode: session.conversation().mode,
        model: session.model().to_string(),
        streaming: StreamingState::Idle,
        status: None,
        pending: false,
        printed: None,
    };
    spawn_session(session, command_rx, event_tx);

    enable_raw_mode()?;
    let mut stdout = io::stdout();
    let (_, rows) = size()?;
    if rows > 0 {
        // Push existing screen content into scrollback without clearing it.
        for _ in 0..rows {
            writeln!(stdout)?;
        }
        stdout.flush()?;
    }
    execute!(stdout, MoveTo(0, 0))?;
    let backend = CrosstermBackend::new(stdout);
    let mut terminal = Terminal::with_options(
        backend,
        TerminalOptions {
            viewport: Viewport::Inline(INPUT_HEIGHT),
        },
    )?;

    let _guard = TerminalGuard;

    terminal.draw(|f| app.draw(f))?;

    while !app.should_quit {
        if !app.handle_events(&mut terminal)? {
            break;
        }

        terminal.draw(|f| app.draw(f))?;

        std::thread::sleep(Duration::from_millis(10));
    }

    disable_raw_mode()?;
    let mut stdout = io::stdout();
    stdout.flush()?;

    Ok(())
}
