//! Parsing full curl invocations back into structured requests
//!
//! Suites may carry a complete `curl`/`kubectl exec ... -- curl` command in
//! the Command cell; the loader extracts method, URL, headers and payload
//! from it. The mock transport reuses the same parser to replay a built
//! command as a plain HTTP request.

use testpilot_common::{Error, HttpMethod, Result};

/// Structured view of a curl command line
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ParsedCurl {
    pub method: HttpMethod,
    pub url: String,
    pub headers: Vec<(String, String)>,
    pub payload: Option<String>,
}

/// Split a command line into words, honoring single and double quotes
pub fn split_words(command: &str) -> Vec<String> {
    let mut words = Vec::new();
    let mut current = String::new();
    let mut in_word = false;
    let mut chars = command.chars().peekable();

    while let Some(c) = chars.next() {
        match c {
            '\'' => {
                in_word = true;
                for q in chars.by_ref() {
                    if q == '\'' {
                        break;
                    }
                    current.push(q);
                }
            }
            '"' => {
                in_word = true;
                while let Some(q) = chars.next() {
                    match q {
                        '"' => break,
                        '\\' => {
                            if let Some(escaped) = chars.next() {
                                current.push(escaped);
                            }
                        }
                        other => current.push(other),
                    }
                }
            }
            '\\' => {
                in_word = true;
                if let Some(escaped) = chars.next() {
                    current.push(escaped);
                }
            }
            c if c.is_whitespace() => {
                if in_word {
                    words.push(std::mem::take(&mut current));
                    in_word = false;
                }
            }
            other => {
                in_word = true;
                current.push(other);
            }
        }
    }
    if in_word {
        words.push(current);
    }
    words
}

/// Extract the request from a command line containing a curl invocation.
/// Wrapping (`kubectl exec ... -- curl ...`, pipelines) before the final
/// `curl` word is ignored.
pub fn parse_curl_command(command: &str) -> Result<ParsedCurl> {
    let words = split_words(command);
    let start = words
        .iter()
        .rposition(|w| w == "curl")
        .ok_or_else(|| Error::input(format!("No curl invocation found in: {command}")))?;

    let mut method: Option<HttpMethod> = None;
    let mut url: Option<String> = None;
    let mut headers = Vec::new();
    let mut payload: Option<String> = None;

    let mut iter = words[start + 1..].iter().peekable();
    while let Some(word) = iter.next() {
        match word.as_str() {
            "-X" | "--request" => {
                if let Some(m) = iter.next() {
                    method = Some(m.parse()?);
                }
            }
            "-H" | "--header" => {
                if let Some(header) = iter.next() {
                    if let Some((name, value)) = header.split_once(':') {
                        headers.push((name.trim().to_string(), value.trim().to_string()));
                    }
                }
            }
            "-d" | "--data" | "--data-raw" | "--data-binary" => {
                if let Some(body) = iter.next() {
                    payload = Some(body.clone());
                }
            }
            // Flags taking a value we do not model
            "-o" | "--output" | "-u" | "--user" | "--connect-timeout" | "--max-time"
            | "--cacert" | "--cert" | "--key" => {
                iter.next();
            }
            w if w.starts_with('-') => {}
            w => {
                if url.is_none() {
                    url = Some(w.to_string());
                }
            }
        }
    }

    let url = url.ok_or_else(|| Error::input(format!("No URL found in: {command}")))?;
    let method = method.unwrap_or({
        if payload.is_some() {
            HttpMethod::Post
        } else {
            HttpMethod::Get
        }
    });

    Ok(ParsedCurl {
        method,
        url,
        headers,
        payload,
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn splits_quoted_words() {
        let words = split_words(r#"curl -H 'Content-Type: application/json' -d '{"a":1}'"#);
        assert_eq!(
            words,
            vec![
                "curl",
                "-H",
                "Content-Type: application/json",
                "-d",
                r#"{"a":1}"#
            ]
        );
    }

    #[test]
    fn splits_escaped_quotes() {
        let words = split_words(r#"echo 'it'"'"'s'"#);
        assert_eq!(words, vec!["echo", "it's"]);
    }

    #[test]
    fn parses_plain_curl() {
        let parsed = parse_curl_command(
            r#"curl -v --http2-prior-knowledge -X PUT 'http://nrf:8081/nnrf-nfm/v1/nf-instances/' -H 'Content-Type: application/json' -d '{"nfInstanceId":"abc"}'"#,
        )
        .unwrap();
        assert_eq!(parsed.method, HttpMethod::Put);
        assert_eq!(parsed.url, "http://nrf:8081/nnrf-nfm/v1/nf-instances/");
        assert_eq!(
            parsed.headers,
            vec![("Content-Type".to_string(), "application/json".to_string())]
        );
        assert_eq!(parsed.payload.as_deref(), Some(r#"{"nfInstanceId":"abc"}"#));
    }

    #[test]
    fn parses_kubectl_wrapped_curl() {
        let parsed = parse_curl_command(
            "kubectl get po -n ns | head -n 1 | xargs -I{} kubectl exec -i {} -n ns -c app -- \
             curl -v -X GET 'http://svc:8080/status'",
        )
        .unwrap();
        assert_eq!(parsed.method, HttpMethod::Get);
        assert_eq!(parsed.url, "http://svc:8080/status");
    }

    #[test]
    fn default_method_depends_on_payload() {
        let get = parse_curl_command("curl http://svc/api").unwrap();
        assert_eq!(get.method, HttpMethod::Get);
        let post = parse_curl_command("curl http://svc/api -d '{}'").unwrap();
        assert_eq!(post.method, HttpMethod::Post);
    }

    #[test]
    fn missing_curl_is_input_error() {
        assert!(parse_curl_command("wget http://svc/api").is_err());
    }
}
