pub const LINECAM_INDEX_HTML: &str = r#"<!doctype html>
<html lang="en">
<head>
  <meta charset="UTF-8" />
  <meta name="viewport" content="width=device-width, initial-scale=1.0" />
  <title>linecam</title>
  <style>
    body { background: #10151c; color: #d8dee9; font-family: ui-monospace, monospace; margin: 1.5rem; }
    h1 { font-size: 1.2rem; margin: 0 0 1rem; }
    .row { display: flex; gap: 1.5rem; flex-wrap: wrap; align-items: flex-start; }
    img { border: 1px solid #2e3440; max-width: 100%; }
    #live { width: 640px; }
    #composite { width: 320px; }
    fieldset { border: 1px solid #2e3440; margin: 0 0 0.8rem; padding: 0.6rem; }
    button, select, input { background: #1c2430; color: inherit; border: 1px solid #3b4252; padding: 0.25rem 0.5rem; }
    input { width: 5rem; }
    #status { white-space: pre; font-size: 0.85rem; }
    #message { color: #ebcb8b; min-height: 1.2rem; }
  </style>
</head>
<body>
  <h1>Line crossing detector</h1>
  <div class="row">
    <div>
      <img id="live" src="/stream.mjpg" alt="live preview" /><br />
      <img id="composite" src="/composite.jpg" alt="diagnostic composite" />
    </div>
    <div>
      <fieldset>
        <legend>Mode</legend>
        <button onclick="control('cooldown')">Cool down</button>
        <button onclick="control('recalibrate')">Recalibrate</button>
        <button onclick="control('autofocus')">Autofocus</button>
      </fieldset>
      <fieldset>
        <legend>Tracker</legend>
        <select id="tracker" onchange="control('tracker', 'name', this.value)"></select>
      </fieldset>
      <fieldset>
        <legend>Geometry</legend>
        <label>line x <input id="line_x" type="number" min="0" /></label>
        <button onclick="setValue('line_x')">Set</button><br />
        <label>min y % <input id="min_y" type="number" min="0" max="100" /></label>
        <button onclick="setValue('min_y')">Set</button><br />
        <label>max y % <input id="max_y" type="number" min="0" max="100" /></label>
        <button onclick="setValue('max_y')">Set</button>
      </fieldset>
      <div id="message"></div>
      <div id="status"></div>
    </div>
  </div>
  <script>
    async function control(action, key, value) {
      const query = key ? `?${key}=${encodeURIComponent(value)}` : "";
      const response = await fetch(`/control/${action}${query}`, { method: "POST" });
      const body = await response.json().catch(() => ({ message: response.statusText }));
      document.getElementById("message").textContent = `${response.status} ${body.message}`;
    }

    function setValue(name) {
      control(name, "value", document.getElementById(name).value);
    }

    async function loadTrackers() {
      const response = await fetch("/trackers");
      const body = await response.json();
      const select = document.getElementById("tracker");
      select.innerHTML = "";
      for (const name of body.available) {
        const option = document.createElement("option");
        option.value = name;
        option.textContent = name;
        option.selected = name === body.active;
        select.appendChild(option);
      }
    }

    async function refreshStatus() {
      const response = await fetch("/status");
      if (response.status === 200) {
        const status = await response.json();
        document.getElementById("status").textContent = JSON.stringify(status, null, 2);
      }
      document.getElementById("composite").src = `/composite.jpg?t=${Date.now()}`;
    }

    loadTrackers();
    refreshStatus();
    setInterval(refreshStatus, 1000);
  </script>
</body>
</html>
"#;
