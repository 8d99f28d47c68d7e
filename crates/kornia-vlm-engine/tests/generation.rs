mod common;

use std::ops::ControlFlow;
use std::sync::Arc;

use common::{peak, scripted_context, ScriptedModel};
use kornia_vlm_engine::{GenerationParams, LmInput, StopReason, VlmError};

const VOCAB: usize = 16;
const EOS: u32 = 15;

fn greedy(max_tokens: usize) -> GenerationParams {
    GenerationParams {
        max_tokens,
        temperature: 0.0,
        ..Default::default()
    }
}

/// Next token is `(cache length) % 10`, so every step produces a different id.
fn counting_model(max_context: usize) -> ScriptedModel {
    ScriptedModel::new(VOCAB, max_context, |len| peak(VOCAB, (len % 10) as u32))
}

#[test]
fn test_zero_temperature_picks_argmax() -> Result<(), VlmError> {
    let model = ScriptedModel::new(3, 64, |_| vec![0.1, 5.0, 0.2]);
    let (context, _) = scripted_context(model, 0);

    let mut stream = context.generate(LmInput::from_tokens(vec![0, 2]), greedy(1))?;
    let token = stream.next().unwrap()?;
    assert_eq!(token.id, 1);
    assert_eq!(token.step, 0);
    assert!(stream.next().is_none());
    assert_eq!(stream.stop_reason(), Some(&StopReason::MaxTokens));

    // degenerate top-p also selects the arg-max
    let params = GenerationParams {
        temperature: 0.8,
        top_p: 0.0,
        ..greedy(3)
    };
    let output = context.generate_text(LmInput::from_tokens(vec![0]), params)?;
    assert_eq!(output.tokens, vec![1, 1, 1]);
    Ok(())
}

#[test]
fn test_end_of_sequence_at_step_seven() -> Result<(), VlmError> {
    let prompt = vec![3, 4, 5];
    let eos_len = prompt.len() + 6;
    let model = ScriptedModel::new(VOCAB, 128, move |len| {
        if len == eos_len {
            peak(VOCAB, EOS)
        } else {
            peak(VOCAB, 7)
        }
    });
    let (context, model) = scripted_context(model, 0);
    assert!(context.end_token_ids().is_empty());

    let params = GenerationParams {
        stop_token_ids: vec![EOS],
        ..greedy(50)
    };
    let output = context.generate_text(LmInput::from_tokens(prompt), params)?;
    assert_eq!(output.tokens.len(), 7);
    assert_eq!(output.tokens[6], EOS);
    assert_eq!(output.stop_reason, StopReason::StopToken(EOS));
    // stop tokens do not reach the text
    assert_eq!(output.text, " t7".repeat(6));
    // one prefill plus six decode steps
    assert_eq!(model.forward_count(), 7);
    Ok(())
}

#[test]
fn test_checkpoint_eos_ends_the_session() -> Result<(), VlmError> {
    let model = ScriptedModel::new(VOCAB, 64, |len| {
        if len >= 4 {
            peak(VOCAB, EOS)
        } else {
            peak(VOCAB, 9)
        }
    });
    let (context, _) = scripted_context(model, 0);
    let end_ids = vec![EOS];
    let stream = kornia_vlm_engine::TokenStream::new(
        context.model().clone(),
        context.tokenizer().clone(),
        LmInput::from_tokens(vec![1, 2]),
        greedy(50),
        end_ids,
        0,
    )?;
    let output = stream.collect_output()?;
    assert_eq!(output.tokens, vec![9, 9, EOS]);
    assert_eq!(output.stop_reason, StopReason::EndOfSequence);
    assert_eq!(output.text, " t9 t9");
    Ok(())
}

#[test]
fn test_context_length_checked_before_forward() {
    let (context, model) = scripted_context(counting_model(8), 0);

    let result = context.generate(LmInput::from_tokens(vec![1; 9]), greedy(4));
    assert!(matches!(
        result,
        Err(VlmError::ContextLengthExceeded {
            requested: 9,
            maximum: 8
        })
    ));
    assert_eq!(model.forward_count(), 0);

    // a lowered window applies to new sessions
    let limited = context.clone().with_max_context(4);
    assert!(matches!(
        limited.generate(LmInput::from_tokens(vec![1; 5]), greedy(4)),
        Err(VlmError::ContextLengthExceeded { maximum: 4, .. })
    ));
    assert_eq!(model.forward_count(), 0);
}

#[test]
fn test_decode_stops_at_context_limit() -> Result<(), VlmError> {
    let (context, _) = scripted_context(counting_model(6), 0);
    let mut stream = context.generate(LmInput::from_tokens(vec![1; 4]), greedy(10))?;

    // prefill fills 4 slots, two decode steps fill the rest
    for _ in 0..3 {
        stream.next().unwrap()?;
    }
    assert!(matches!(
        stream.next(),
        Some(Err(VlmError::ContextLengthExceeded {
            requested: 7,
            maximum: 6
        }))
    ));
    assert!(stream.next().is_none());
    assert_eq!(stream.cached_tokens(), 0);
    Ok(())
}

#[test]
fn test_chunked_prefill_matches_unchunked() -> Result<(), VlmError> {
    const CHUNK: usize = 4;
    for prompt_len in [1, 2, CHUNK, CHUNK + 1, 2 * CHUNK] {
        let prompt: Vec<u32> = (0..prompt_len as u32).map(|i| i % 10).collect();

        let (whole, whole_model) = scripted_context(counting_model(64), 0);
        let (chunked, chunked_model) = scripted_context(counting_model(64), CHUNK);

        let a = whole.generate_text(LmInput::from_tokens(prompt.clone()), greedy(6))?;
        let b = chunked.generate_text(LmInput::from_tokens(prompt), greedy(6))?;
        assert_eq!(a.tokens, b.tokens, "prompt length {prompt_len}");
        assert_eq!(a.text, b.text);

        let decode_steps = a.tokens.len() - 1;
        assert_eq!(whole_model.forward_count(), 1 + decode_steps);
        assert_eq!(
            chunked_model.forward_count(),
            prompt_len.div_ceil(CHUNK) + decode_steps
        );
    }
    Ok(())
}

#[test]
fn test_per_call_chunk_size_overrides_context() -> Result<(), VlmError> {
    let (context, model) = scripted_context(counting_model(64), 0);
    let params = GenerationParams {
        prefill_chunk_size: Some(2),
        ..greedy(1)
    };
    context.generate_text(LmInput::from_tokens(vec![1, 2, 3, 4, 5]), params)?;
    assert_eq!(model.forward_count(), 3);
    Ok(())
}

#[test]
fn test_cache_tracks_processed_tokens() -> Result<(), VlmError> {
    let (context, _) = scripted_context(counting_model(64), 3);
    let prompt_len = 5;
    let mut stream = context.generate(LmInput::from_tokens(vec![2; prompt_len]), greedy(20))?;
    assert_eq!(stream.cached_tokens(), 0);

    let mut emitted = 0;
    while let Some(token) = stream.next() {
        token?;
        emitted += 1;
        // the newest token has not been fed back yet
        assert_eq!(stream.cached_tokens(), prompt_len + emitted - 1);
    }
    assert_eq!(emitted, 20);
    Ok(())
}

#[test]
fn test_stop_strings_truncate_text() -> Result<(), VlmError> {
    let (context, _) = scripted_context(counting_model(64), 0);
    let params = GenerationParams {
        stop_strings: vec!["t5".into()],
        ..greedy(20)
    };
    // cache lengths 3, 4, 5 give tokens 3, 4, 5
    let output = context.generate_text(LmInput::from_tokens(vec![0, 0, 0]), params)?;
    assert_eq!(output.tokens, vec![3, 4, 5]);
    assert_eq!(output.text, " t3 t4 ");
    assert_eq!(output.stop_reason, StopReason::StopString("t5".into()));
    Ok(())
}

/// Text deltas of every token of a drained stream, plus its output.
fn stream_deltas(
    mut stream: kornia_vlm_engine::TokenStream,
) -> Result<(Vec<String>, kornia_vlm_engine::GenerationOutput), VlmError> {
    let mut deltas = Vec::new();
    for token in stream.by_ref() {
        deltas.push(token?.text);
    }
    Ok((deltas, stream.collect_output()?))
}

#[test]
fn test_stop_string_spanning_tokens_is_never_streamed() -> Result<(), VlmError> {
    let (context, _) = scripted_context(counting_model(64), 0);

    // " t4" may start "t4 t5", so it waits for the next token
    let params = GenerationParams {
        stop_strings: vec!["t4 t5".into()],
        ..greedy(20)
    };
    let stream = context.generate(LmInput::from_tokens(vec![0, 0, 0]), params)?;
    let (deltas, output) = stream_deltas(stream)?;
    assert_eq!(deltas, vec![" t3", " ", ""]);
    assert_eq!(output.text, " t3 ");
    assert_eq!(deltas.concat(), output.text);
    assert_eq!(output.stop_reason, StopReason::StopString("t4 t5".into()));

    // a held tail that does not complete the stop string is released with the next token
    let params = GenerationParams {
        stop_strings: vec!["t4 t6".into()],
        ..greedy(5)
    };
    let stream = context.generate(LmInput::from_tokens(vec![0, 0, 0]), params)?;
    let (deltas, output) = stream_deltas(stream)?;
    assert_eq!(deltas, vec![" t3", " ", "t4 t5", " t6", " t7"]);
    assert_eq!(deltas.concat(), output.text);
    assert_eq!(output.stop_reason, StopReason::MaxTokens);
    Ok(())
}

/// Byte-level tokenizer whose incomplete UTF-8 sequences decode to U+FFFD.
struct Bytes;

impl kornia_vlm_engine::TextTokenizer for Bytes {
    fn encode(&self, text: &str) -> Result<Vec<u32>, VlmError> {
        Ok(text.bytes().map(u32::from).collect())
    }

    fn decode(&self, ids: &[u32]) -> Result<String, VlmError> {
        let bytes: Vec<u8> = ids.iter().map(|&id| id as u8).collect();
        Ok(String::from_utf8_lossy(&bytes).into_owned())
    }

    fn token_to_id(&self, _token: &str) -> Option<u32> {
        None
    }
}

#[test]
fn test_end_of_sequence_flushes_held_back_bytes() -> Result<(), VlmError> {
    const BYTES: usize = 256;
    const END: u32 = 255;
    // 'h', then the lead byte of a two-byte character, then end of sequence
    let model = ScriptedModel::new(BYTES, 64, |len| match len {
        1 => peak(BYTES, u32::from(b'h')),
        2 => peak(BYTES, 0xC3),
        _ => peak(BYTES, END),
    });
    let (context, _) = scripted_context(model, 0);
    let stream = kornia_vlm_engine::TokenStream::new(
        context.model().clone(),
        Arc::new(Bytes),
        LmInput::from_tokens(vec![0]),
        greedy(10),
        vec![END],
        0,
    )?;
    let (deltas, output) = stream_deltas(stream)?;
    assert_eq!(output.tokens, vec![u32::from(b'h'), 0xC3, END]);
    assert_eq!(output.stop_reason, StopReason::EndOfSequence);
    assert_eq!(deltas, vec!["h", "", "\u{FFFD}"]);
    assert_eq!(output.text, "h\u{FFFD}");
    Ok(())
}

#[test]
fn test_stop_predicate() -> Result<(), VlmError> {
    let (context, _) = scripted_context(counting_model(64), 0);
    let params = GenerationParams {
        stop_predicate: Some(Arc::new(|text: &str| text.split_whitespace().count() >= 2)),
        ..greedy(20)
    };
    let output = context.generate_text(LmInput::from_tokens(vec![0]), params)?;
    assert_eq!(output.tokens, vec![1, 2]);
    assert_eq!(output.stop_reason, StopReason::Predicate);
    Ok(())
}

#[test]
fn test_callback_can_stop_generation() -> Result<(), VlmError> {
    let (context, model) = scripted_context(counting_model(64), 0);
    let mut seen = Vec::new();
    let output = context.generate_with(LmInput::from_tokens(vec![0]), greedy(20), |token| {
        seen.push(token.id);
        if token.step == 2 {
            ControlFlow::Break(())
        } else {
            ControlFlow::Continue(())
        }
    })?;
    assert_eq!(seen, vec![1, 2, 3]);
    assert_eq!(output.tokens, seen);
    assert_eq!(output.stop_reason, StopReason::Callback);
    assert_eq!(model.forward_count(), 3);
    Ok(())
}

#[test]
fn test_zero_max_tokens() -> Result<(), VlmError> {
    let (context, model) = scripted_context(counting_model(64), 0);
    let output = context.generate_text(LmInput::from_tokens(vec![0]), greedy(0))?;
    assert!(output.tokens.is_empty());
    assert_eq!(output.stop_reason, StopReason::MaxTokens);
    assert_eq!(model.forward_count(), 0);
    Ok(())
}

#[test]
fn test_empty_prompt_is_rejected() {
    let (context, _) = scripted_context(counting_model(64), 0);
    assert!(matches!(
        context.generate(LmInput::default(), greedy(4)),
        Err(VlmError::TokenizationFailure(_))
    ));
}

#[test]
fn test_non_finite_logits_end_only_that_session() -> Result<(), VlmError> {
    let model = ScriptedModel::new(VOCAB, 64, |len| {
        if len == 3 {
            vec![f32::NAN; VOCAB]
        } else {
            peak(VOCAB, 4)
        }
    });
    let (context, _) = scripted_context(model, 0);

    let mut stream = context.generate(LmInput::from_tokens(vec![0, 0]), greedy(5))?;
    assert_eq!(stream.next().unwrap()?.id, 4);
    assert!(matches!(
        stream.next(),
        Some(Err(VlmError::InferenceFailure(_)))
    ));
    assert!(stream.next().is_none());

    // the shared model still serves new sessions
    let output = context.generate_text(LmInput::from_tokens(vec![0, 0, 0, 0]), greedy(2))?;
    assert_eq!(output.tokens, vec![4, 4]);
    Ok(())
}

#[test]
fn test_sampling_is_seeded() -> Result<(), VlmError> {
    let model = ScriptedModel::new(VOCAB, 64, |_| vec![1.0; VOCAB]);
    let (context, _) = scripted_context(model, 0);
    let params = GenerationParams {
        temperature: 1.0,
        seed: 7,
        ..greedy(8)
    };
    let a = context.generate_text(LmInput::from_tokens(vec![0]), params.clone())?;
    let b = context.generate_text(LmInput::from_tokens(vec![0]), params)?;
    assert_eq!(a.tokens, b.tokens);
    assert!(a.tokens.iter().all(|&t| (t as usize) < VOCAB));
    Ok(())
}

#[test]
fn test_concurrent_sessions_share_the_model() {
    let (context, model) = scripted_context(counting_model(64), 2);
    let expected = context
        .generate_text(LmInput::from_tokens(vec![0, 1, 2]), greedy(5))
        .unwrap()
        .tokens;

    let handles: Vec<_> = (0..4)
        .map(|_| {
            let context = context.clone();
            std::thread::spawn(move || {
                context
                    .generate_text(LmInput::from_tokens(vec![0, 1, 2]), greedy(5))
                    .unwrap()
                    .tokens
            })
        })
        .collect();
    for handle in handles {
        assert_eq!(handle.join().unwrap(), expected);
    }
    // 2 prefill chunks and 4 decode steps per session
    assert_eq!(model.forward_count(), 5 * 6);
}

#[test]
fn test_abandoned_stream_releases_cache() -> Result<(), VlmError> {
    let (context, _) = scripted_context(counting_model(64), 0);
    let mut stream = context.generate(LmInput::from_tokens(vec![0, 1]), greedy(10))?;
    stream.next().unwrap()?;
    stream.next().unwrap()?;
    assert_eq!(stream.cached_tokens(), 3);

    stream.stop(StopReason::Callback);
    assert_eq!(stream.cached_tokens(), 0);
    assert!(stream.next().is_none());
    assert_eq!(stream.tokens().len(), 2);
    Ok(())
}
