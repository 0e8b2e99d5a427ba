use anyhow::Result;
use clap::Parser;
use kaiwa::cli::{Cli, Commands, ConfigAction};
use kaiwa::completion::CompletionStreamer;
use kaiwa::config::{BackendEndpoint, Settings};
use kaiwa::playback::{AudioPlayer, PlaybackSink};
use kaiwa::session::{ConversationSession, SessionState, SessionUpdate};
use kaiwa::transcript::{NullTranscriptSource, TranscriptSource};
use kaiwa::tts::Synthesizer;
use std::path::Path;
use std::sync::Arc;
use tokio::io::{AsyncBufReadExt, BufReader};

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();
    init_logging(cli.quiet, cli.verbose);

    let settings = load_settings(&cli)?;

    match cli.command {
        None => run_chat(settings).await,
        Some(Commands::Say { text, output }) => run_say(settings, &text, &output).await,
        Some(Commands::Translate { text, to }) => run_translate(settings, &text, &to).await,
        Some(Commands::Config { action }) => handle_config(settings, action),
    }
}

fn init_logging(quiet: bool, verbose: u8) {
    let level = if quiet {
        "error"
    } else {
        match verbose {
            0 => "warn",
            1 => "info",
            _ => "debug",
        }
    };
    env_logger::Builder::from_env(env_logger::Env::default().default_filter_or(level)).init();
}

fn load_settings(cli: &Cli) -> Result<Settings> {
    // An explicit --config must exist; the default path may not
    let mut settings = match &cli.config {
        Some(path) => Settings::load(path)?,
        None => Settings::load_or_default(&Settings::default_path())?,
    }
    .with_env_overrides();

    if cli.local {
        settings.generation.endpoint = BackendEndpoint::Local;
    }
    if let Some(language) = &cli.language {
        settings.transcription.language = language.clone();
    }
    Ok(settings)
}

fn playback_sink() -> Box<dyn PlaybackSink> {
    #[cfg(feature = "playback-device")]
    {
        match kaiwa::playback::RodioPlaybackSink::new() {
            Ok(sink) => return Box::new(sink),
            Err(e) => log::warn!("audio output unavailable, replies will be silent: {e}"),
        }
    }
    Box::new(kaiwa::playback::NullPlaybackSink)
}

/// Voice input when a microphone backend is compiled in and the realtime
/// endpoint has credentials; typed-only otherwise.
fn transcript_source(settings: &kaiwa::SettingsHandle) -> Box<dyn TranscriptSource> {
    #[cfg(feature = "cpal-audio")]
    {
        let snapshot = settings.snapshot();
        if snapshot.transcription.mode == kaiwa::config::TranscriptionMode::Realtime
            && let Some(key) = snapshot.generation.api_key.clone()
        {
            match kaiwa::audio::CpalMicrophoneSource::new(kaiwa::defaults::SAMPLE_RATE) {
                Ok(mic) => {
                    return Box::new(kaiwa::transcript::realtime::RealtimeTranscriber::new(
                        snapshot.transcription.clone(),
                        key,
                        Box::new(mic),
                    ));
                }
                Err(e) => log::warn!("microphone unavailable, voice input disabled: {e}"),
            }
        }
    }
    let _ = settings;
    Box::new(NullTranscriptSource::new())
}

/// Interactive chat with the persona.
async fn run_chat(settings: Settings) -> Result<()> {
    let handle = settings.into_handle();
    let source = transcript_source(&handle);
    let streamer = Arc::new(CompletionStreamer::new(handle.clone()));
    let synthesizer = Arc::new(Synthesizer::new(handle.clone()));
    let player = AudioPlayer::new(playback_sink());

    let (session, mut updates) =
        ConversationSession::spawn(source, streamer, synthesizer, player, handle);

    let printer = tokio::spawn(async move {
        while let Some(update) = updates.recv().await {
            match update {
                SessionUpdate::StateChanged(SessionState::Listening) => {}
                SessionUpdate::StateChanged(state) => {
                    log::info!("session state: {state:?}");
                }
                SessionUpdate::LiveTranscript(text) if !text.is_empty() => {
                    eprintln!("... {text}");
                }
                SessionUpdate::LiveTranscript(_) => {}
                SessionUpdate::HistoryChanged(turns) => {
                    if let Some(turn) = turns.last()
                        && turn.role == kaiwa::Role::Assistant
                        && !turn.text.is_empty()
                    {
                        eprintln!("<< {}", turn.text);
                    }
                }
                SessionUpdate::StageError { message } => {
                    eprintln!("error: {message}");
                }
            }
        }
    });

    session.connect().await;
    eprintln!("Type a message and press enter. /quit exits, /reset clears the conversation.");

    let mut lines = BufReader::new(tokio::io::stdin()).lines();
    while let Ok(Some(line)) = lines.next_line().await {
        match line.trim() {
            "" => {}
            "/quit" | "/q" => break,
            "/reset" => {
                session.disconnect().await;
                session.connect().await;
            }
            text => session.send_text(text).await,
        }
    }

    session.disconnect().await;
    drop(session);
    let _ = printer.await;
    Ok(())
}

/// One-shot synthesis to a file.
async fn run_say(settings: Settings, text: &str, output: &Path) -> Result<()> {
    let synthesizer = Synthesizer::new(settings.into_handle());
    let audio = synthesizer.synthesize(text).await?;
    if audio.is_empty() {
        anyhow::bail!("nothing to speak after cleaning the text");
    }
    std::fs::write(output, &audio)?;
    eprintln!("wrote {} bytes to {}", audio.len(), output.display());
    Ok(())
}

/// One-shot translation through the completion endpoint.
async fn run_translate(settings: Settings, text: &str, to: &str) -> Result<()> {
    let streamer = CompletionStreamer::new(settings.into_handle());
    let instruction = format!(
        "Translate the user's message into {to}. Answer with only the translation."
    );
    let translated = streamer.translate(text, &instruction).await?;
    println!("{translated}");
    Ok(())
}

fn handle_config(settings: Settings, action: ConfigAction) -> Result<()> {
    match action {
        ConfigAction::Path => {
            println!("{}", Settings::default_path().display());
        }
        ConfigAction::Show => {
            print!("{}", toml::to_string_pretty(&settings)?);
        }
    }
    Ok(())
}
