//! Active (pending and processing tasks)
//! Finished (completed and failed tasks still within their hour)
//! Queue (jobs waiting in RabbitMQ)

use std::{
  error::Error,
  io,
  sync::{mpsc, Arc},
  thread,
  time::{Duration, Instant},
};

use chrono::Utc;
use crossterm::{
  event::{self, DisableMouseCapture, EnableMouseCapture, Event as CEvent, KeyCode},
  execute,
  terminal::{disable_raw_mode, enable_raw_mode, EnterAlternateScreen, LeaveAlternateScreen},
};
use lapin::options::QueueDeclareOptions;
use lapin::types::FieldTable;
use lapin::Channel;
use tokio::runtime::Runtime;
use tui::{
  backend::{Backend, CrosstermBackend},
  layout::{Constraint, Direction, Layout, Rect},
  style::{Color, Modifier, Style},
  text::{Span, Spans},
  widgets::{Block, Borders, List, ListItem, Paragraph, Tabs},
  Terminal,
};

use imgprompt::config::Config;
use imgprompt::database::setup_database;
use imgprompt::messaging::create_rabbit_channel;
use imgprompt::models::{now_millis, TaskStatus};
use imgprompt::store::postgres::TaskSummary;
use imgprompt::store::PgTaskStore;

const RECENT_LIMIT: i64 = 50;

struct TaskLine {
  id: String,
  status: TaskStatus,
  age_secs: i64,
  detail: String,
}

#[derive(Clone, Copy)]
enum DashboardTab {
  Active,
  Finished,
  Queue,
}

#[derive(Default)]
struct Snapshot {
  active: Vec<TaskLine>,
  finished: Vec<TaskLine>,
  queue_depth: Option<u32>,
  error: Option<String>,
}

struct App {
  current_tab: DashboardTab,
  snapshot: Snapshot,
  queue_name: String,
}

impl App {
  fn new(queue_name: String) -> Self {
    Self { current_tab: DashboardTab::Active, snapshot: Snapshot::default(), queue_name }
  }

  fn next_tab(&mut self) {
    self.current_tab = match self.current_tab {
      DashboardTab::Active => DashboardTab::Finished,
      DashboardTab::Finished => DashboardTab::Queue,
      DashboardTab::Queue => DashboardTab::Active,
    }
  }

  fn previous_tab(&mut self) {
    self.current_tab = match self.current_tab {
      DashboardTab::Active => DashboardTab::Queue,
      DashboardTab::Finished => DashboardTab::Active,
      DashboardTab::Queue => DashboardTab::Finished,
    }
  }
}

fn task_line(summary: TaskSummary, now_ms: i64) -> TaskLine {
  let detail = match (summary.task.state.result(), summary.task.state.error()) {
    (Some(result), _) => format!("file {} | {}", result.file_id, result.prompt),
    (None, Some(error)) => error.to_string(),
    (None, None) => format!("updated {}", summary.updated_at.format("%H:%M:%S")),
  };
  TaskLine {
    status: summary.task.status(),
    age_secs: (now_ms - summary.task.start_time).max(0) / 1000,
    id: summary.task_id,
    detail,
  }
}

async fn fetch_snapshot(store: &PgTaskStore, channel: Option<&Channel>, queue: &str) -> Snapshot {
  let mut snapshot = Snapshot::default();
  let now_ms = now_millis();
  match store.recent(RECENT_LIMIT).await {
    Ok(rows) => {
      for summary in rows {
        if summary.task.is_expired_at(now_ms) {
          continue;
        }
        let line = task_line(summary, now_ms);
        if line.status.is_terminal() {
          snapshot.finished.push(line);
        } else {
          snapshot.active.push(line);
        }
      }
    }
    Err(e) => snapshot.error = Some(e.to_string()),
  }
  if let Some(channel) = channel {
    snapshot.queue_depth = channel
      .queue_declare(queue, QueueDeclareOptions { passive: true, ..Default::default() }, FieldTable::default())
      .await
      .ok()
      .map(|q| q.message_count());
  }
  snapshot
}

fn main() -> Result<(), Box<dyn Error>> {
  let config = Config::from_env()?;
  let database_url = config
    .database_url
    .clone()
    .ok_or("DATABASE_URL is required for the dashboard")?;

  let rt = Runtime::new()?;
  let store = Arc::new(PgTaskStore::new(rt.block_on(setup_database(&database_url))?));
  let channel = match config.rabbitmq_url.as_deref() {
    Some(url) => Some(Arc::new(rt.block_on(create_rabbit_channel(url))?)),
    None => None,
  };

  let (tx, rx) = mpsc::channel::<Snapshot>();
  {
    let queue = config.task_queue.clone();
    thread::spawn(move || {
      let rt_bg = match Runtime::new() {
        Ok(rt) => rt,
        Err(e) => {
          let _ = tx.send(Snapshot { error: Some(e.to_string()), ..Snapshot::default() });
          return;
        }
      };
      loop {
        let snapshot = rt_bg.block_on(fetch_snapshot(&store, channel.as_deref(), &queue));
        if tx.send(snapshot).is_err() {
          break;
        }
        thread::sleep(Duration::from_secs(2));
      }
    });
  }

  enable_raw_mode()?;
  let mut stdout = io::stdout();
  execute!(stdout, EnterAlternateScreen, EnableMouseCapture)?;
  let backend = CrosstermBackend::new(stdout);
  let mut terminal = Terminal::new(backend)?;

  let mut app = App::new(config.task_queue.clone());
  let tick_rate = Duration::from_millis(500);
  let mut last_tick = Instant::now();

  loop {
    if let Ok(snapshot) = rx.try_recv() {
      app.snapshot = snapshot;
    }
    terminal.draw(|f| ui(f, &app))?;

    let timeout = tick_rate
      .checked_sub(last_tick.elapsed())
      .unwrap_or_else(|| Duration::from_secs(0));
    if event::poll(timeout)? {
      if let CEvent::Key(key) = event::read()? {
        match key.code {
          KeyCode::Char('q') => break,
          KeyCode::Right => app.next_tab(),
          KeyCode::Left => app.previous_tab(),
          _ => {}
        }
      }
    }
    if last_tick.elapsed() >= tick_rate {
      last_tick = Instant::now();
    }
  }

  disable_raw_mode()?;
  execute!(terminal.backend_mut(), LeaveAlternateScreen, DisableMouseCapture)?;
  terminal.show_cursor()?;
  Ok(())
}

fn ui<B: Backend>(f: &mut tui::Frame<B>, app: &App) {
  let chunks = Layout::default()
    .direction(Direction::Vertical)
    .margin(1)
    .constraints([
      Constraint::Length(3),
      Constraint::Min(0),
      Constraint::Length(3),
    ].as_ref())
    .split(f.size());

  let tab_titles = vec!["Active", "Finished", "Queue"];
  let tabs = Tabs::new(
    tab_titles
      .iter()
      .map(|t| Spans::from(Span::styled(*t, Style::default().fg(Color::Yellow))))
      .collect(),
  )
    .block(Block::default().borders(Borders::ALL).title("Image Prompt Tasks"))
    .highlight_style(Style::default().fg(Color::Cyan).add_modifier(Modifier::BOLD))
    .select(match app.current_tab {
      DashboardTab::Active => 0,
      DashboardTab::Finished => 1,
      DashboardTab::Queue => 2,
    });
  f.render_widget(tabs, chunks[0]);

  match app.current_tab {
    DashboardTab::Active => render_tasks(f, &app.snapshot.active, "Pending / Processing", chunks[1]),
    DashboardTab::Finished => render_tasks(f, &app.snapshot.finished, "Completed / Failed", chunks[1]),
    DashboardTab::Queue => render_queue(f, app, chunks[1]),
  }

  let footer_text = match &app.snapshot.error {
    Some(e) => format!("error: {} | q: Quit", e),
    None => format!("←/→: Switch Tabs | q: Quit | {}", Utc::now().format("%H:%M:%S")),
  };
  let footer = Paragraph::new(footer_text)
    .style(Style::default().fg(Color::White))
    .block(Block::default().borders(Borders::ALL));
  f.render_widget(footer, chunks[2]);
}

fn status_color(status: TaskStatus) -> Color {
  match status {
    TaskStatus::Pending => Color::Yellow,
    TaskStatus::Processing => Color::Cyan,
    TaskStatus::Completed => Color::Green,
    TaskStatus::Failed => Color::Red,
  }
}

fn render_tasks<B: Backend>(f: &mut tui::Frame<B>, tasks: &[TaskLine], title: &str, area: Rect) {
  let items: Vec<ListItem> = if tasks.is_empty() {
    vec![ListItem::new(Spans::from(Span::raw("No tasks")))]
  } else {
    tasks.iter().map(|t| {
      ListItem::new(vec![
        Spans::from(vec![
          Span::styled(format!("{:<11}", t.status.as_str()), Style::default().fg(status_color(t.status))),
          Span::styled(t.id.clone(), Style::default().add_modifier(Modifier::BOLD)),
          Span::raw(format!("  {}s", t.age_secs)),
        ]),
        Spans::from(Span::raw(format!("           {}", t.detail))),
      ])
    }).collect()
  };
  let list = List::new(items).block(Block::default().borders(Borders::ALL).title(title.to_string()));
  f.render_widget(list, area);
}

fn render_queue<B: Backend>(f: &mut tui::Frame<B>, app: &App, area: Rect) {
  let depth = match app.snapshot.queue_depth {
    Some(n) => format!("{} job(s) waiting in '{}'", n, app.queue_name),
    None => "RabbitMQ not reachable or RABBITMQ_URL unset".to_string(),
  };
  let lines = vec![
    ListItem::new(Spans::from(Span::styled(depth, Style::default().fg(Color::Yellow)))),
    ListItem::new(Spans::from(Span::raw(format!(
      "{} active, {} finished in the last {} updates",
      app.snapshot.active.len(),
      app.snapshot.finished.len(),
      RECENT_LIMIT
    )))),
  ];
  let list = List::new(lines).block(Block::default().borders(Borders::ALL).title("Queue"));
  f.render_widget(list, area);
}
