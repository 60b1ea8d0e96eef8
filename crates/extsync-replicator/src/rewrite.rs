//! Hostname localization for replicated routing rules
//!
//! A replica living in namespace `team-b` must answer on `team-b.example.com`
//! rather than on the source's `team-a.example.com`. [`localize_host`] swaps
//! the leftmost DNS label; [`rewrite_match`] applies it to every hostname
//! argument of the `Host(...)` predicates inside a Traefik rule and leaves
//! every other byte of the expression alone.

/// Replace the leftmost label of `host` with `namespace`.
///
/// `sub.example.com` becomes `<namespace>.example.com`; a host without any
/// dot becomes `namespace` itself.
pub fn localize_host(namespace: &str, host: &str) -> String {
    match host.split_once('.') {
        Some((_, rest)) => format!("{}.{}", namespace, rest),
        None => namespace.to_string(),
    }
}

/// Localize the hostnames of every `Host(...)` predicate in `expr`.
///
/// With a non-empty `fallback`, each hostname argument is replaced by the
/// localized fallback (so several hosts in one call collapse to the same
/// value). Without one, each original hostname is localized in place.
/// One trailing newline is dropped from the result.
pub fn rewrite_match(namespace: &str, expr: &str, fallback: Option<&str>) -> String {
    if !expr.contains("Host") {
        return expr.to_string();
    }

    let fallback = fallback.filter(|f| !f.is_empty());
    let mut rewritten = String::with_capacity(expr.len() + namespace.len());
    let mut host_arguments_next = false;

    for token in uncut_split(expr, |c| c == '(' || c == ')') {
        if host_arguments_next {
            rewritten.push_str(&rewrite_arguments(namespace, token, fallback));
            host_arguments_next = false;
            continue;
        }
        host_arguments_next = token.contains("Host");
        rewritten.push_str(token);
    }

    if rewritten.ends_with('\n') {
        rewritten.pop();
    }
    rewritten
}

/// Rewrite the backtick-quoted arguments of one predicate call.
///
/// Splitting on backticks puts quoted values at the odd indices.
fn rewrite_arguments(namespace: &str, arguments: &str, fallback: Option<&str>) -> String {
    arguments
        .split('`')
        .enumerate()
        .map(|(index, segment)| {
            if index % 2 == 0 {
                segment.to_string()
            } else {
                localize_host(namespace, fallback.unwrap_or(segment))
            }
        })
        .collect::<Vec<_>>()
        .join("`")
}

/// Split `input` before every delimiter character, keeping the delimiter at
/// the start of the token it opens. Concatenating the tokens reproduces the
/// input exactly.
fn uncut_split(input: &str, is_delimiter: impl Fn(char) -> bool) -> Vec<&str> {
    let mut tokens = Vec::new();
    let mut start = 0;
    for (index, c) in input.char_indices() {
        if is_delimiter(c) && index > start {
            tokens.push(&input[start..index]);
            start = index;
        }
    }
    if start < input.len() {
        tokens.push(&input[start..]);
    }
    tokens
}
