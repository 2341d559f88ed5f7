use std::io::Write;
use std::time::Instant;

use futures_util::StreamExt;
use switchyard_llm::sse::text_deltas;
use switchyard_llm::{CallOptions, CompletionRequest, Dispatcher, LlmError, Message};
use switchyard_telemetry::UsageMetrics;
use tokio_util::sync::CancellationToken;

/// One-shot chat invocation
pub struct Chat {
    pub model: Option<String>,
    pub system: Option<String>,
    pub stream: bool,
    pub prompt: String,
}

/// Send the prompt and print the answer; Ctrl+C cancels the call
pub async fn run(
    dispatcher: &Dispatcher,
    metrics: &UsageMetrics,
    chat: Chat,
) -> anyhow::Result<()> {
    let mut messages = Vec::with_capacity(2);
    if let Some(system) = chat.system {
        messages.push(Message::system(system));
    }
    messages.push(Message::user(chat.prompt));

    let request = CompletionRequest::new(chat.model.unwrap_or_default(), messages);

    let signal = CancellationToken::new();
    let trigger = signal.clone();
    let _interrupt = tokio::spawn(async move {
        if tokio::signal::ctrl_c().await.is_ok() {
            trigger.cancel();
        }
    });

    let options = CallOptions::default().with_signal(signal);
    let context = dispatcher.resolve(Some(&request.model));
    let started = Instant::now();

    tracing::info!(provider = %context.provider, model = %context.model, "sending prompt");

    let result = if chat.stream {
        print_stream(dispatcher, &request, &options).await
    } else {
        print_completion(dispatcher, &request, &options).await
    };

    let outcome = match result {
        Ok(()) => "ok",
        Err(ref e) if e.is_cancellation() => "cancelled",
        Err(_) => "error",
    };
    metrics.record_request(context.provider.as_str(), &context.model, outcome, started.elapsed());

    result?;
    Ok(())
}

async fn print_completion(
    dispatcher: &Dispatcher,
    request: &CompletionRequest,
    options: &CallOptions,
) -> Result<(), LlmError> {
    let response = dispatcher.call_provider(request, options).await?;

    println!("{}", response.text().unwrap_or_default());

    if let Some(usage) = response.usage {
        tracing::info!(
            prompt_tokens = usage.prompt_tokens,
            completion_tokens = usage.completion_tokens,
            "completion finished"
        );
    }

    Ok(())
}

async fn print_stream(
    dispatcher: &Dispatcher,
    request: &CompletionRequest,
    options: &CallOptions,
) -> Result<(), LlmError> {
    let stream = dispatcher.call_provider_stream(request, options).await?;
    let mut chunks = Box::pin(text_deltas(stream));
    let mut stdout = std::io::stdout();

    while let Some(chunk) = chunks.next().await {
        let chunk = chunk?;

        if let Some(text) = chunk.delta_text {
            // A closed stdout is not worth failing the call over
            let _ = stdout.write_all(text.as_bytes());
            let _ = stdout.flush();
        }

        if chunk.done {
            break;
        }
    }

    let _ = writeln!(stdout);
    Ok(())
}
