/// Call that closes every generated calendar script and carries the user-facing text.
pub const REPLY_SENTINEL: &str = "sendReply";

/// Generated text split into what runs and what the user reads.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct GeneratedScript {
    /// Everything before the first sentinel, passed whole to the script runner.
    pub script: String,
    /// Un-escaped string argument of the sentinel call; empty when it cannot be parsed.
    pub reply: String,
    pub has_sentinel: bool,
}

/// Splits model output at the first `sendReply` call.
///
/// The reply is the call's quoted argument (`"`, `'` or backtick quoted). Escaped backticks and
/// escaped copies of the active quote character are un-escaped. Nothing after the sentinel ever
/// reaches the script, and nothing before it ever reaches the reply.
pub fn split_generated(raw: &str) -> GeneratedScript {
    let Some((script, tail)) = raw.split_once(REPLY_SENTINEL) else {
        return GeneratedScript {
            script: raw.to_string(),
            reply: String::new(),
            has_sentinel: false,
        };
    };

    GeneratedScript {
        script: script.to_string(),
        reply: parse_reply_argument(tail).unwrap_or_default(),
        has_sentinel: true,
    }
}

fn parse_reply_argument(tail: &str) -> Option<String> {
    let argument = tail.trim_start().strip_prefix('(')?.trim_start();
    let quote = argument
        .chars()
        .next()
        .filter(|ch| matches!(ch, '"' | '\'' | '`'))?;
    let body = &argument[quote.len_utf8()..];

    let closing = format!("{quote})");
    let end = body
        .match_indices(&closing)
        .map(|(index, _)| index)
        .find(|&index| {
            !body[..index].ends_with('\\') && closes_statement(&body[index + closing.len()..])
        })
        .or_else(|| body.rfind(&closing))
        .or_else(|| body.rfind(quote))?;

    let escaped_quote = format!("\\{quote}");
    Some(
        body[..end]
            .replace("\\`", "`")
            .replace(&escaped_quote, &quote.to_string()),
    )
}

/// True when only an optional `;` and whitespace remain before the end of the line.
fn closes_statement(rest: &str) -> bool {
    let line = rest.split('\n').next().unwrap_or_default();
    line.trim().trim_start_matches(';').trim().is_empty()
}
