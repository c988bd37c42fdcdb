use crate::attachment::Attachment;
use crate::protocol::{ChatMessage, Role};
use crate::session::ChatSession;
use crate::voice::{DEFAULT_VOICE_PRESET, VoiceClient};
use crossterm::event::{self, Event, KeyCode, KeyEvent, KeyModifiers};
use crossterm::execute;
use crossterm::terminal::{
    EnterAlternateScreen, LeaveAlternateScreen, disable_raw_mode, enable_raw_mode,
};
use ratatui::backend::CrosstermBackend;
use ratatui::layout::{Constraint, Layout, Rect};
use ratatui::style::{Color, Modifier, Style};
use ratatui::text::{Line, Span, Text};
use ratatui::widgets::{Block, Borders, Paragraph, Wrap};
use ratatui::{Frame, Terminal};
use std::io;
use std::io::Write;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::mpsc;
use uuid::Uuid;

type UiResult<T> = Result<T, Box<dyn std::error::Error + Send + Sync>>;

const INPUT_HEIGHT: u16 = 6;

pub struct UiConfig {
    pub voice: VoiceClient,
    pub speech_dir: PathBuf,
}

// Restores terminal settings even if the loop exits early.
struct TerminalGuard;

impl TerminalGuard {
    fn new() -> Self {
        Self
    }
}

impl Drop for TerminalGuard {
    fn drop(&mut self) {
        let _ = disable_raw_mode();
        let _ = execute!(io::stdout(), LeaveAlternateScreen);
        let _ = io::stdout().flush();
    }
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

fn message_lines(message: &ChatMessage, streaming: bool) -> Vec<LineSpec> {
    let (label, color) = match (message.role, message.is_error) {
        (_, true) => ("Error:", Color::Red),
        (Role::User, false) => ("You:", Color::Blue),
        (Role::Assistant, false) => ("Gemma:", Color::Yellow),
        (Role::System, false) => ("System:", Color::Gray),
    };
    let header_style = Style::default().fg(color).add_modifier(Modifier::BOLD);
    let body_style = Style::default().fg(color);

    let mut lines = vec![LineSpec::new(label, header_style)];
    let body = if message.is_error {
        format!("⚠ {}", message.content)
    } else {
        message.content.clone()
    };
    for line in body.lines() {
        lines.push(LineSpec::new(format!("  {}", line), body_style));
    }
    if streaming {
        lines.push(LineSpec::new("  …", body_style.add_modifier(Modifier::DIM)));
    }
    if let Some(reference) = &message.attachment {
        lines.push(LineSpec::new(
            format!("  📎 {}", reference),
            Style::default()
                .fg(Color::Cyan)
                .add_modifier(Modifier::UNDERLINED),
        ));
    }
    lines.push(LineSpec::new("", Style::default()));
    lines
}

fn rendered_height(lines: &[LineSpec], width: u16) -> usize {
    let width = width.max(1) as usize;
    lines
        .iter()
        .map(|line| Line::raw(line.text.as_str()).width().max(1).div_ceil(width))
        .sum()
}

// Keeps the cursor inside the input block's border, even on tiny terminals.
fn cursor_position(area: Rect, column: u16, row: u16) -> (u16, u16) {
    let x = area
        .x
        .saturating_add(column.saturating_add(1))
        .min(area.x.saturating_add(area.width.saturating_sub(2)));
    let y = area
        .y
        .saturating_add(row.saturating_add(1))
        .min(area.y.saturating_add(area.height.saturating_sub(2)));
    (x, y)
}

/// Slash commands typed into the input box.
#[derive(Debug, PartialEq, Eq)]
enum Command {
    Attach(Option<PathBuf>),
    Clear,
    Speak,
    Transcribe(PathBuf),
    Help,
    Unknown(String),
}

impl Command {
    fn parse(input: &str) -> Option<Self> {
        let input = input.trim();
        let rest = input.strip_prefix('/')?;
        let (name, arg) = match rest.split_once(char::is_whitespace) {
            Some((name, arg)) => (name, arg.trim()),
            None => (rest, ""),
        };

        Some(match name {
            "attach" if arg.is_empty() => Command::Attach(None),
            "attach" => Command::Attach(Some(PathBuf::from(arg))),
            "clear" => Command::Clear,
            "speak" => Command::Speak,
            "transcribe" if !arg.is_empty() => Command::Transcribe(PathBuf::from(arg)),
            "help" => Command::Help,
            _ => Command::Unknown(input.to_string()),
        })
    }
}

const HELP: &str = "/attach <file> stages a file, /attach clears it, /clear, /speak, /transcribe <audio>";

#[derive(Debug)]
pub enum UiEvent {
    Attached(Attachment),
    Transcribed(String),
    Status(String),
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

    fn set_text(&mut self, text: &str) {
        self.lines = text.split('\n').map(str::to_string).collect();
        self.cursor_y = self.lines.len() - 1;
        self.cursor_x = self.line_len(self.cursor_y);
    }

    fn line_len(&self, y: usize) -> usize {
        self.lines[y].chars().count()
    }

    // Cursor positions count characters; editing needs byte offsets.
    fn byte_index(&self) -> usize {
        let line = &self.lines[self.cursor_y];
        line.char_indices()
            .nth(self.cursor_x)
            .map(|(index, _)| index)
            .unwrap_or(line.len())
    }

    fn insert_char(&mut self, c: char) {
        let index = self.byte_index();
        self.lines[self.cursor_y].insert(index, c);
        self.cursor_x += 1;
    }

    fn delete_char(&mut self) {
        if self.cursor_x > 0 {
            self.cursor_x -= 1;
            let index = self.byte_index();
            self.lines[self.cursor_y].remove(index);
        } else if self.cursor_y > 0 {
            let removed = self.lines.remove(self.cursor_y);
            self.cursor_y -= 1;
            self.cursor_x = self.line_len(self.cursor_y);
            self.lines[self.cursor_y].push_str(&removed);
        }
    }

    fn new_line(&mut self) {
        let index = self.byte_index();
        let remaining = self.lines[self.cursor_y].split_off(index);
        self.lines.insert(self.cursor_y + 1, remaining);
        self.cursor_y += 1;
        self.cursor_x = 0;
    }

    fn move_left(&mut self) {
        if self.cursor_x > 0 {
            self.cursor_x -= 1;
        } else if self.cursor_y > 0 {
            self.cursor_y -= 1;
            self.cursor_x = self.line_len(self.cursor_y);
        }
    }

    fn move_right(&mut self) {
        if self.cursor_x < self.line_len(self.cursor_y) {
            self.cursor_x += 1;
        } else if self.cursor_y < self.lines.len() - 1 {
            self.cursor_y += 1;
            self.cursor_x = 0;
        }
    }

    fn move_up(&mut self) {
        if self.cursor_y > 0 {
            self.cursor_y -= 1;
            self.cursor_x = self.cursor_x.min(self.line_len(self.cursor_y));
        }
    }

    fn move_down(&mut self) {
        if self.cursor_y < self.lines.len() - 1 {
            self.cursor_y += 1;
            self.cursor_x = self.cursor_x.min(self.line_len(self.cursor_y));
        }
    }

    fn home(&mut self) {
        self.cursor_x = 0;
    }

    fn end(&mut self) {
        self.cursor_x = self.line_len(self.cursor_y);
    }

    fn text(&self) -> String {
        self.lines.join("\n")
    }

    fn is_empty(&self) -> bool {
        self.lines.iter().all(|l| l.trim().is_empty())
    }

    fn render(&self, busy: bool) -> Text<'static> {
        if self.is_empty() {
            let hint = if busy {
                "Waiting for the reply..."
            } else {
                "Type your message here... (/help for commands)"
            };
            return Text::from(Span::styled(hint, Style::default().fg(Color::DarkGray)));
        }
        Text::from(
            self.lines
                .iter()
                .map(|l| Line::from(l.clone()))
                .collect::<Vec<_>>(),
        )
    }
}

impl Default for InputBuffer {
    fn default() -> Self {
        Self::new()
    }
}

pub struct App {
    session: Arc<ChatSession>,
    voice: VoiceClient,
    speech_dir: PathBuf,
    input: InputBuffer,
    staged: Option<Attachment>,
    status: Option<String>,
    // Lines scrolled up from the bottom of the log.
    scroll_back: usize,
    should_quit: bool,
    sender: mpsc::Sender<UiEvent>,
    receiver: mpsc::Receiver<UiEvent>,
}

impl App {
    pub fn new(session: Arc<ChatSession>, config: UiConfig) -> Self {
        let (sender, receiver) = mpsc::channel(100);

        Self {
            session,
            voice: config.voice,
            speech_dir: config.speech_dir,
            input: InputBuffer::new(),
            staged: None,
            status: None,
            scroll_back: 0,
            should_quit: false,
            sender,
            receiver,
        }
    }

    fn draw(&mut self, f: &mut Frame) {
        let [log_area, input_area] =
            Layout::vertical([Constraint::Min(1), Constraint::Length(INPUT_HEIGHT)])
                .areas(f.area());

        let busy = self.session.is_busy();
        let messages = self.session.conversation().snapshot();
        let last = messages.len().saturating_sub(1);
        let specs: Vec<LineSpec> = messages
            .iter()
            .enumerate()
            .flat_map(|(index, message)| {
                let streaming = busy && index == last && message.role == Role::Assistant;
                message_lines(message, streaming)
            })
            .collect();

        let inner_width = log_area.width.saturating_sub(2);
        let inner_height = log_area.height.saturating_sub(2) as usize;
        let total = rendered_height(&specs, inner_width);
        let max_scroll = total.saturating_sub(inner_height);
        self.scroll_back = self.scroll_back.min(max_scroll);
        let offset = (max_scroll - self.scroll_back).min(u16::MAX as usize) as u16;

        let text = Text::from(
            specs
                .into_iter()
                .map(|spec| Line::from(Span::styled(spec.text, spec.style)))
                .collect::<Vec<_>>(),
        );
        let log = Paragraph::new(text)
            .block(
                Block::default()
                    .borders(Borders::ALL)
                    .title(format!(" Gemma chat ({}) ", self.session.client().base_url()))
                    .border_style(Style::default().fg(Color::DarkGray)),
            )
            .wrap(Wrap { trim: false })
            .scroll((offset, 0));
        f.render_widget(log, log_area);

        let title = if busy {
            " Input (Enter to send, Esc to quit) [Gemma is typing...] "
        } else {
            " Input (Enter to send, Esc to quit) "
        };
        let mut block = Block::default()
            .borders(Borders::ALL)
            .title(title)
            .border_style(Style::default().fg(Color::DarkGray));
        if let Some(attachment) = &self.staged {
            let note = if attachment.is_text() {
                format!(" 📎 {} (first 200 unique lines) ", attachment.name)
            } else {
                format!(" 📎 {} ", attachment.name)
            };
            block = block.title_bottom(Line::from(note).left_aligned());
        }
        if let Some(status) = &self.status {
            block = block.title_bottom(Line::from(format!(" {} ", status)).right_aligned());
        }

        let input_paragraph = Paragraph::new(self.input.render(busy))
            .block(block)
            .wrap(Wrap { trim: false });
        f.render_widget(input_paragraph, input_area);

        f.set_cursor_position(cursor_position(
            input_area,
            self.input.cursor_x as u16,
            self.input.cursor_y as u16,
        ));
    }

    fn handle_events(&mut self) -> UiResult<bool> {
        while let Ok(event) = self.receiver.try_recv() {
            match event {
                UiEvent::Attached(attachment) => {
                    self.status = Some(format!("attached {}", attachment.name));
                    self.staged = Some(attachment);
                }
                UiEvent::Transcribed(text) => {
                    self.input.set_text(&text);
                    self.status = Some("transcription ready".to_string());
                }
                UiEvent::Status(status) => {
                    self.status = Some(status);
                }
            }
        }

        if event::poll(Duration::from_millis(50))? {
            if let Event::Key(key) = event::read()? {
                self.handle_key(key);
            }
        }

        Ok(!self.should_quit)
    }

    fn handle_key(&mut self, key: KeyEvent) {
        if key.modifiers.contains(KeyModifiers::CONTROL) && key.code == KeyCode::Char('c') {
            self.should_quit = true;
            return;
        }

        match key.code {
            KeyCode::Esc => {
                self.should_quit = true;
            }
            KeyCode::Enter => {
                if key.modifiers.contains(KeyModifiers::SHIFT) {
                    self.input.new_line();
                } else if !self.input.is_empty() {
                    self.submit();
                }
            }
            KeyCode::Char(c) => self.input.insert_char(c),
            KeyCode::Backspace => self.input.delete_char(),
            KeyCode::Left => self.input.move_left(),
            KeyCode::Right => self.input.move_right(),
            KeyCode::Up => self.input.move_up(),
            KeyCode::Down => self.input.move_down(),
            KeyCode::Home => self.input.home(),
            KeyCode::End => self.input.end(),
            KeyCode::PageUp => self.scroll_back = self.scroll_back.saturating_add(5),
            KeyCode::PageDown => self.scroll_back = self.scroll_back.saturating_sub(5),
            _ => {}
        }
    }

    fn submit(&mut self) {
        let text = self.input.text();
        if let Some(command) = Command::parse(&text) {
            self.input.clear();
            self.run_command(command);
            return;
        }

        if self.session.is_busy() {
            self.status = Some("wait for the current reply to finish".to_string());
            return;
        }

        self.input.clear();
        self.status = None;
        self.scroll_back = 0;

        let session = Arc::clone(&self.session);
        let sender = self.sender.clone();
        let attachment = self.staged.take();
        tokio::spawn(async move {
            // Failures past validation are already in the conversation.
            if let Err(err) = session.send(&text, attachment).await {
                if err.is_rejection() {
                    let _ = sender.send(UiEvent::Status(err.to_string())).await;
                }
            }
        });
    }

    fn run_command(&mut self, command: Command) {
        let sender = self.sender.clone();
        match command {
            Command::Attach(None) => {
                self.staged = None;
                self.status = Some("attachment cleared".to_string());
            }
            Command::Attach(Some(path)) => {
                tokio::spawn(async move {
                    let event = match Attachment::load(&path).await {
                        Ok(attachment) => UiEvent::Attached(attachment),
                        Err(err) => UiEvent::Status(err.to_string()),
                    };
                    let _ = sender.send(event).await;
                });
            }
            Command::Clear => {
                if self.session.is_busy() {
                    self.status = Some("wait for the current reply to finish".to_string());
                } else {
                    self.session.clear();
                    self.status = Some("conversation cleared".to_string());
                }
            }
            Command::Speak => {
                let Some(text) = self.session.conversation().last_assistant_content() else {
                    self.status = Some("nothing to speak yet".to_string());
                    return;
                };
                let voice = self.voice.clone();
                let path = self.speech_dir.join(format!("reply-{}.wav", Uuid::new_v4()));
                self.status = Some("synthesizing speech...".to_string());
                tokio::spawn(async move {
                    let status = match speak(&voice, &text, &path).await {
                        Ok(()) => format!("speech saved to {}", path.display()),
                        Err(err) => {
                            tracing::error!(error = %err, "speech synthesis failed");
                            err.to_string()
                        }
                    };
                    let _ = sender.send(UiEvent::Status(status)).await;
                });
            }
            Command::Transcribe(path) => {
                let voice = self.voice.clone();
                self.status = Some("transcribing...".to_string());
                tokio::spawn(async move {
                    let event = match voice.transcribe(&path).await {
                        Ok(text) => UiEvent::Transcribed(text),
                        Err(err) => {
                            tracing::error!(error = %err, "transcription failed");
                            UiEvent::Status(err.to_string())
                        }
                    };
                    let _ = sender.send(event).await;
                });
            }
            Command::Help => self.status = Some(HELP.to_string()),
            Command::Unknown(input) => {
                self.status = Some(format!("unknown command {input}; /help lists commands"));
            }
        }
    }
}

async fn speak(voice: &VoiceClient, text: &str, path: &Path) -> UiResult<()> {
    let audio = voice.synthesize(text, DEFAULT_VOICE_PRESET).await?;
    if let Some(parent) = path.parent() {
        tokio::fs::create_dir_all(parent).await?;
    }
    tokio::fs::write(path, &audio).await?;
    Ok(())
}

pub fn run_tui(session: Arc<ChatSession>, config: UiConfig) -> UiResult<()> {
    enable_raw_mode()?;
    let mut stdout = io::stdout();
    execute!(stdout, EnterAlternateScreen)?;
    let backend = CrosstermBackend::new(stdout);
    let mut terminal = Terminal::new(backend)?;

    let _guard = TerminalGuard::new();
    let mut app = App::new(session, config);

    terminal.draw(|f| app.draw(f))?;

    while app.handle_events()? {
        terminal.draw(|f| app.draw(f))?;
    }

    Ok(())
}
