use std::io::{self, Write};

use anyhow::Result;
use base64::engine::general_purpose::STANDARD as BASE64;
use base64::Engine;
use crossterm::{
    cursor,
    event::{Event, KeyCode, KeyEvent, KeyModifiers},
    style::{Attribute, Print, SetAttribute},
    terminal::{Clear, ClearType},
    QueueableCommand,
};
use folio_core::{Command, LoadState, OutlineEntry, PageNumber, RenderImage, ViewerStatus};
use png::{BitDepth, ColorType, Encoder};
use tracing::trace;

/// Draws page images with the kitty graphics protocol.
pub struct KittyRenderer<W: Write> {
    writer: W,
    image_id: u32,
    placement_id: u32,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct DrawParams {
    pub columns: u32,
    pub rows: u32,
}

impl DrawParams {
    pub fn clamped(columns: u32, rows: u32) -> Self {
        Self {
            columns: columns.max(1),
            rows: rows.max(1),
        }
    }

    /// Largest cell box inside `columns` x `rows` keeping the image's aspect.
    /// `cell_aspect` is cell height over cell width.
    pub fn fit(image: &RenderImage, columns: u32, rows: u32, cell_aspect: f64) -> Self {
        let Some(aspect) = image.aspect_ratio() else {
            return Self::clamped(columns, rows);
        };
        let cell_aspect = if cell_aspect > 0.0 { cell_aspect } else { 2.0 };
        let rows_at_full_width = (columns as f64 * aspect / cell_aspect).round() as u32;
        if rows_at_full_width <= rows {
            return Self::clamped(columns, rows_at_full_width);
        }
        let columns_at_full_height = (rows as f64 * cell_aspect / aspect).round() as u32;
        Self::clamped(columns_at_full_height.min(columns), rows)
    }
}

impl<W: Write> KittyRenderer<W> {
    pub fn new(writer: W) -> Self {
        Self {
            writer,
            image_id: 1,
            placement_id: 1,
        }
    }

    pub fn writer(&mut self) -> &mut W {
        &mut self.writer
    }

    pub fn draw(&mut self, image: &RenderImage, params: DrawParams) -> Result<()> {
        let mut buffer = Vec::new();
        let mut encoder = Encoder::new(&mut buffer, image.width, image.height);
        encoder.set_color(ColorType::Rgba);
        encoder.set_depth(BitDepth::Eight);
        let mut writer = encoder.write_header()?;
        writer.write_image_data(&image.pixels)?;
        writer.finish()?;

        let encoded = BASE64.encode(&buffer);
        let mut chunks = encoded.as_bytes().chunks(4096).peekable();
        let mut first = true;
        trace!(bytes = encoded.len(), ?params, "sending page image");

        while let Some(chunk) = chunks.next() {
            let more = u8::from(chunks.peek().is_some());
            if first {
                write!(
                    self.writer,
                    "\u{1b}_Ga=T,f=100,C=1,q=2,i={},p={},c={},r={},s={},v={},z=-1,m={}",
                    self.image_id,
                    self.placement_id,
                    params.columns,
                    params.rows,
                    image.width,
                    image.height,
                    more
                )?;
                first = false;
            } else {
                write!(self.writer, "\u{1b}_Gm={},q=2", more)?;
            }
            if !chunk.is_empty() {
                self.writer.write_all(b";")?;
                self.writer.write_all(chunk)?;
            }
            write!(self.writer, "\u{1b}\\")?;
        }

        self.writer.flush()?;
        Ok(())
    }

    /// Removes the placed page image, used while a page is pending or broken.
    pub fn delete_image(&mut self) -> Result<()> {
        write!(self.writer, "\u{1b}_Ga=d,d=i,i={},q=2\u{1b}\\", self.image_id)?;
        self.writer.flush()?;
        Ok(())
    }

    pub fn begin_sync_update(&mut self) -> Result<()> {
        write!(self.writer, "\u{1b}[?2026h")?;
        Ok(())
    }

    /// The terminal renders all buffered changes at once.
    pub fn end_sync_update(&mut self) -> Result<()> {
        write!(self.writer, "\u{1b}[?2026l")?;
        self.writer.flush()?;
        Ok(())
    }

    pub fn clear_all(&mut self) -> Result<()> {
        crossterm::execute!(
            &mut self.writer,
            Clear(ClearType::All),
            cursor::MoveTo(0, 0)
        )?;
        Ok(())
    }
}

#[derive(Debug, Clone, PartialEq)]
pub enum UiEvent {
    Command(Command),
    OpenOutline,
    CloseOverlay,
    OutlineMoveSelection { delta: isize },
    OutlineActivateSelection,
    Quit,
    None,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum InputMode {
    #[default]
    Normal,
    Outline,
}

/// Turns key presses into viewer commands, keeping a vim style count prefix.
#[derive(Debug, Default)]
pub struct EventMapper {
    pending_count: Option<usize>,
    pending_digits: String,
    mode: InputMode,
}

impl EventMapper {
    /// Pixels moved by one line scroll.
    pub const SCROLL_STEP: f64 = 60.0;

    pub fn new() -> Self {
        Self::default()
    }

    pub fn set_mode(&mut self, mode: InputMode) {
        if self.mode != mode {
            self.reset_count();
            self.mode = mode;
        }
    }

    pub fn mode(&self) -> InputMode {
        self.mode
    }

    pub fn map_event(&mut self, event: Event) -> UiEvent {
        match self.mode {
            InputMode::Normal => self.map_event_normal(event),
            InputMode::Outline => self.map_event_outline(event),
        }
    }

    fn map_event_normal(&mut self, event: Event) -> UiEvent {
        let Event::Key(KeyEvent {
            code, modifiers, ..
        }) = event
        else {
            return UiEvent::None;
        };
        match (code, modifiers) {
            (KeyCode::Char(c), KeyModifiers::NONE) if c.is_ascii_digit() => {
                if let Some(digit) = c.to_digit(10) {
                    self.push_digit(digit as usize);
                }
                UiEvent::None
            }
            (KeyCode::Char('c'), modifiers) if modifiers.contains(KeyModifiers::CONTROL) => {
                self.reset_count();
                UiEvent::Quit
            }
            (KeyCode::Char('d'), modifiers) if modifiers.contains(KeyModifiers::CONTROL) => {
                let count = self.take_count() as isize;
                UiEvent::Command(Command::ScrollScreens { count })
            }
            (KeyCode::Char('u'), modifiers) if modifiers.contains(KeyModifiers::CONTROL) => {
                let count = self.take_count() as isize;
                UiEvent::Command(Command::ScrollScreens { count: -count })
            }
            (KeyCode::PageDown, _) | (KeyCode::Char(' '), KeyModifiers::NONE) => {
                let count = self.take_count() as isize;
                UiEvent::Command(Command::ScrollScreens { count })
            }
            (KeyCode::PageUp, _) => {
                let count = self.take_count() as isize;
                UiEvent::Command(Command::ScrollScreens { count: -count })
            }
            (KeyCode::Char('j'), KeyModifiers::NONE) | (KeyCode::Down, KeyModifiers::NONE) => {
                self.scroll(1.0)
            }
            (KeyCode::Char('k'), KeyModifiers::NONE) | (KeyCode::Up, KeyModifiers::NONE) => {
                self.scroll(-1.0)
            }
            (KeyCode::Char('n'), KeyModifiers::NONE)
            | (KeyCode::Char('J'), KeyModifiers::SHIFT)
            | (KeyCode::Right, KeyModifiers::NONE) => {
                let count = self.take_count();
                UiEvent::Command(Command::NextPage { count })
            }
            (KeyCode::Char('p'), KeyModifiers::NONE)
            | (KeyCode::Char('K'), KeyModifiers::SHIFT)
            | (KeyCode::Left, KeyModifiers::NONE) => {
                let count = self.take_count();
                UiEvent::Command(Command::PrevPage { count })
            }
            (KeyCode::Char('g'), KeyModifiers::NONE) | (KeyCode::Home, _) => {
                let page = self.take_page().unwrap_or(1);
                UiEvent::Command(Command::GotoPage { page })
            }
            (KeyCode::Char('G'), KeyModifiers::SHIFT) | (KeyCode::End, _) => {
                match self.take_page() {
                    Some(page) => UiEvent::Command(Command::GotoPage { page }),
                    None => UiEvent::Command(Command::LastPage),
                }
            }
            (KeyCode::Char('m'), KeyModifiers::NONE) => {
                self.reset_count();
                UiEvent::Command(Command::ToggleMode)
            }
            (KeyCode::Char('r'), KeyModifiers::NONE) => {
                self.reset_count();
                UiEvent::Command(Command::Reload)
            }
            (KeyCode::Char('t'), _) | (KeyCode::Char('T'), _) => {
                self.reset_count();
                UiEvent::OpenOutline
            }
            (KeyCode::Char('q'), _) => {
                self.reset_count();
                UiEvent::Quit
            }
            _ => {
                self.reset_count();
                UiEvent::None
            }
        }
    }

    fn map_event_outline(&mut self, event: Event) -> UiEvent {
        let Event::Key(KeyEvent {
            code, modifiers, ..
        }) = event
        else {
            return UiEvent::None;
        };
        match (code, modifiers) {
            (KeyCode::Esc, _) | (KeyCode::Char('t'), _) | (KeyCode::Char('T'), _) => {
                UiEvent::CloseOverlay
            }
            (KeyCode::Enter, _) => UiEvent::OutlineActivateSelection,
            (KeyCode::Char('j'), KeyModifiers::NONE) | (KeyCode::Down, KeyModifiers::NONE) => {
                UiEvent::OutlineMoveSelection { delta: 1 }
            }
            (KeyCode::Char('k'), KeyModifiers::NONE) | (KeyCode::Up, KeyModifiers::NONE) => {
                UiEvent::OutlineMoveSelection { delta: -1 }
            }
            (KeyCode::Char('q'), _) => UiEvent::Quit,
            _ => UiEvent::None,
        }
    }

    fn scroll(&mut self, direction: f64) -> UiEvent {
        let lines = self.take_count() as f64;
        UiEvent::Command(Command::ScrollBy {
            pixels: direction * lines * Self::SCROLL_STEP,
        })
    }

    fn push_digit(&mut self, digit: usize) {
        let current = self.pending_count.unwrap_or(0);
        let next = current.saturating_mul(10).saturating_add(digit);
        self.pending_count = Some(next);
        if let Some(c) = char::from_digit(digit as u32, 10) {
            self.pending_digits.push(c);
        }
    }

    fn take_count(&mut self) -> usize {
        self.take_prefix().unwrap_or(1)
    }

    /// The typed prefix as a page number, if one was typed.
    fn take_page(&mut self) -> Option<PageNumber> {
        self.take_prefix()
            .map(|count| count.min(PageNumber::MAX as usize) as PageNumber)
    }

    fn take_prefix(&mut self) -> Option<usize> {
        let count = self.pending_count.take().filter(|&count| count > 0);
        self.pending_digits.clear();
        count
    }

    fn reset_count(&mut self) {
        self.pending_count = None;
        self.pending_digits.clear();
    }

    pub fn pending_input(&self) -> Option<String> {
        (!self.pending_digits.is_empty()).then(|| self.pending_digits.clone())
    }
}

/// Outline overlay: article titles with their starting pages.
#[derive(Debug, Clone, Default)]
pub struct OutlineOverlay {
    entries: Vec<OutlineEntry>,
    selected: usize,
}

impl OutlineOverlay {
    pub fn new(entries: Vec<OutlineEntry>) -> Self {
        Self {
            entries,
            selected: 0,
        }
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    pub fn move_selection(&mut self, delta: isize) {
        if self.entries.is_empty() {
            return;
        }
        let last = self.entries.len() - 1;
        self.selected = self.selected.saturating_add_signed(delta).min(last);
    }

    pub fn selected_page(&self) -> Option<PageNumber> {
        self.entries.get(self.selected).map(|entry| entry.page_number)
    }

    /// Writes the visible window of entries, keeping the selection in view.
    pub fn draw<W: Write>(&self, writer: &mut W, columns: u16, rows: u16) -> io::Result<()> {
        let rows = usize::from(rows.max(1));
        let first = self.selected.saturating_sub(rows.saturating_sub(1));
        writer.queue(Clear(ClearType::All))?;
        for (line, (index, entry)) in self
            .entries
            .iter()
            .enumerate()
            .skip(first)
            .take(rows)
            .enumerate()
        {
            let label = fit_to_width(
                &format!("{:>4}  {}", entry.page_number, entry.title),
                usize::from(columns),
            );
            writer.queue(cursor::MoveTo(0, line as u16))?;
            if index == self.selected {
                writer.queue(SetAttribute(Attribute::Reverse))?;
                writer.queue(Print(label))?;
                writer.queue(SetAttribute(Attribute::Reset))?;
            } else {
                writer.queue(Print(label))?;
            }
        }
        writer.flush()
    }
}

fn fit_to_width(text: &str, width: usize) -> String {
    text.chars().take(width.max(1)).collect()
}

/// One line summary of the viewer state.
pub fn format_status(status: &ViewerStatus, pending: Option<&str>) -> String {
    let document = status
        .document
        .as_ref()
        .map(|id| id.as_str())
        .unwrap_or("-");
    let position = match status.current_page {
        Some(page) => format!("{}/{}", page, status.page_count),
        None => format!("-/{}", status.page_count),
    };
    let state = match status.load_state {
        LoadState::Idle => "idle",
        LoadState::Loading => "loading",
        LoadState::Ready if (status.mounted as u32) < status.page_count => "rendering",
        LoadState::Ready => "ready",
        LoadState::Empty => "not found",
        LoadState::Stalled => "no page images",
    };
    let mut line = format!("{} [{}] {} {}", document, status.mode, position, state);
    if let Some(pending) = pending {
        line.push_str("  ");
        line.push_str(pending);
    }
    line
}

pub fn write_status_line<W: Write>(writer: &mut W, row: u16, label: &str) -> io::Result<()> {
    writer.queue(cursor::MoveTo(0, row))?;
    writer.queue(Clear(ClearType::CurrentLine))?;
    write!(writer, "{}", label)?;
    writer.flush()
}
