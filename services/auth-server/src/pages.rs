//! HTML pages shown in the user's browser after the provider redirect
//!
//! The success page notifies the Telegram in-app browser, when present, so
//! the bot can continue the conversation without the user typing anything.

/// Escape text for inclusion in HTML body content and attribute values.
pub fn escape_html(text: &str) -> String {
    let mut out = String::with_capacity(text.len());
    for c in text.chars() {
        match c {
            '&' => out.push_str("&amp;"),
            '<' => out.push_str("&lt;"),
            '>' => out.push_str("&gt;"),
            '"' => out.push_str("&quot;"),
            '\'' => out.push_str("&#x27;"),
            _ => out.push(c),
        }
    }
    out
}

pub fn success_page(user_id: &str) -> String {
    // serde_json produces a valid JS string literal; `<` is escaped so the
    // value cannot close the script element.
    let js_user = serde_json::to_string(user_id)
        .unwrap_or_else(|_| "\"\"".to_string())
        .replace('<', "\\u003c");
    let user = escape_html(user_id);
    format!(
        r#"<!DOCTYPE html>
<html>
    <head><title>Authentication Successful</title></head>
    <body>
        <h1>Authentication Successful</h1>
        <p>You have successfully authenticated with Google.</p>
        <p>Account: {user}</p>
        <p>You may now close this window and return to TaskIQ.</p>
        <script>
            if (window.TelegramWebviewProxy) {{
                window.TelegramWebviewProxy.postEvent('auth_complete', JSON.stringify({{
                    email: {js_user},
                    success: true
                }}));
            }}
        </script>
    </body>
</html>
"#
    )
}

pub fn error_page(message: &str) -> String {
    let message = escape_html(message);
    format!(
        r#"<!DOCTYPE html>
<html>
    <head><title>Authentication Error</title></head>
    <body>
        <h1>Authentication Error</h1>
        <p>Error: {message}</p>
        <p>Please close this window and try again.</p>
    </body>
</html>
"#
    )
}
