//! Login page served at `/` and `/login`.
//!
//! Six single-digit inputs; on submit the page opens the gateway socket,
//! sends `{id, type: "auth", pin}`, and on `auth_success` stores the PIN in
//! `sessionStorage` before navigating to the configured app path.

const TEMPLATE: &str = r#"<!doctype html>
<html lang="en">
<head>
<meta charset="utf-8">
<meta name="viewport" content="width=device-width, initial-scale=1">
<title>Remote Access</title>
<style>
  body { font-family: system-ui, sans-serif; display: flex; min-height: 100vh;
         align-items: center; justify-content: center; margin: 0; background: #111; color: #eee; }
  form { text-align: center; }
  .digits { display: flex; gap: .5rem; margin: 1.5rem 0; }
  .digits input { width: 2.5rem; height: 3rem; font-size: 1.5rem; text-align: center;
                  border: 1px solid #555; border-radius: .4rem; background: #222; color: #eee; }
  #status { min-height: 1.5rem; color: #f77; }
  button { padding: .5rem 2rem; font-size: 1rem; }
</style>
</head>
<body>
<form id="login">
  <h1>Enter PIN</h1>
  <div class="digits"></div>
  <div id="status"></div>
  <button type="submit">Connect</button>
</form>
<script>
(function () {
  var APP_PATH = __APP_PATH__;
  var form = document.getElementById("login");
  var box = form.querySelector(".digits");
  var status = document.getElementById("status");
  var inputs = [];
  for (var i = 0; i < 6; i++) {
    var input = document.createElement("input");
    input.inputMode = "numeric";
    input.maxLength = 1;
    input.autocomplete = "one-time-code";
    box.appendChild(input);
    inputs.push(input);
  }
  inputs.forEach(function (input, i) {
    input.addEventListener("input", function () {
      input.value = input.value.replace(/[^0-9]/g, "");
      if (input.value && i < 5) inputs[i + 1].focus();
      if (inputs.every(function (el) { return el.value; })) form.requestSubmit();
    });
    input.addEventListener("keydown", function (e) {
      if (e.key === "Backspace" && !input.value && i > 0) inputs[i - 1].focus();
    });
  });
  inputs[0].focus();

  form.addEventListener("submit", function (e) {
    e.preventDefault();
    var pin = inputs.map(function (el) { return el.value; }).join("");
    if (!/^[0-9]{6}$/.test(pin)) { status.textContent = "Enter all six digits"; return; }
    status.textContent = "";
    var scheme = location.protocol === "https:" ? "wss://" : "ws://";
    var ws = new WebSocket(scheme + location.host + "/ws");
    ws.onmessage = function (ev) {
      var msg = JSON.parse(ev.data);
      if (msg.type === "auth_required") {
        ws.send(JSON.stringify({ id: "login", type: "auth", pin: pin }));
      } else if (msg.type === "auth_success") {
        sessionStorage.setItem("remote-access-pin", pin);
        ws.close();
        location.href = APP_PATH;
      } else if (msg.type === "auth_failed") {
        status.textContent = "Invalid PIN";
        inputs.forEach(function (el) { el.value = ""; });
        inputs[0].focus();
        ws.close();
      }
    };
    ws.onerror = function () { status.textContent = "Connection failed"; };
  });
})();
</script>
</body>
</html>
"#;

/// Render the page with `app_path` embedded as a JS string literal.
pub fn render(app_path: &str) -> String {
    let literal = serde_json::to_string(app_path)
        .unwrap_or_else(|_| "\"/\"".to_string())
        // `</script>` inside the literal would end the inline script.
        .replace("</", "<\\/");
    TEMPLATE.replace("__APP_PATH__", &literal)
}
