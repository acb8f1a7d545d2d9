use assistant_chat::conversation::ChatWidget;
use assistant_chat::runtime::ChatRuntime;
use assistant_chat::session_id::{FileStore, KeyValueStore, MemoryStore};
use assistant_chat::settings;
use assistant_chat::state::{ChatEvent, Sender};
use std::io::BufRead;
use std::sync::Arc;

fn main() {
    env_logger::init();

    // First run: write the defaults so the host can be edited by hand.
    if let Err(e) = settings::settings_path().and_then(|path| settings::create_if_missing(&path)) {
        eprintln!("[chat] failed to write settings: {}", e);
    }
    let settings = settings::load();
    let store: Arc<dyn KeyValueStore> = match FileStore::open_default() {
        Ok(store) => Arc::new(store),
        Err(e) => {
            eprintln!("[chat] storage unavailable ({}), session id will not persist", e);
            Arc::new(MemoryStore::new())
        }
    };
    let runtime = match tokio::runtime::Runtime::new() {
        Ok(rt) => rt,
        Err(e) => {
            eprintln!("[chat] failed to create tokio runtime: {}", e);
            return;
        }
    };

    let (event_tx, event_rx) = std::sync::mpsc::channel::<ChatEvent>();
    let widget = ChatWidget::new(settings.clone(), Some(store), None);
    let (handle, task) = {
        let _guard = runtime.enter();
        ChatRuntime::spawn(widget, event_tx)
    };
    println!(
        "[chat] assistant at {}; /open, /close, /mic, /quit, anything else is sent",
        settings.assistant_host
    );

    // Stdin reader thread
    {
        let handle = handle.clone();
        std::thread::spawn(move || {
            let stdin = std::io::stdin();
            for line in stdin.lock().lines() {
                let Ok(line) = line else { break };
                match line.trim() {
                    "/open" => handle.open(),
                    "/close" => handle.close(),
                    "/mic" => handle.toggle_dictation(),
                    "/quit" => break,
                    "" => {}
                    text => handle.send(text),
                }
            }
            handle.shutdown();
        });
    }

    // Runs until the runtime drops its sender on shutdown.
    while let Ok(event) = event_rx.recv() {
        match event {
            ChatEvent::MessageAppended(msg) => {
                let who = match msg.sender {
                    Sender::User => "you",
                    Sender::Assistant => "assistant",
                };
                println!("[{}] {}: {}", msg.timestamp.format("%H:%M"), who, msg.text);
            }
            ChatEvent::TypingChanged(true) => println!("[chat] assistant is typing..."),
            ChatEvent::StatusChanged { label, .. } => println!("[status] {}", label),
            ChatEvent::InterimTranscript(text) if !text.is_empty() => {
                println!("[mic] {}...", text)
            }
            ChatEvent::ListeningChanged(listening) => {
                println!("[mic] {}", if listening { "listening" } else { "stopped" })
            }
            ChatEvent::Alert(text) => eprintln!("[alert] {}", text),
            ChatEvent::Opened => println!("[chat] panel opened"),
            ChatEvent::Closed => println!("[chat] panel closed"),
            other => log::debug!("[chat] {:?}", other),
        }
    }

    if let Err(e) = runtime.block_on(task) {
        log::warn!("[chat] runtime task ended abnormally: {}", e);
    }
}
