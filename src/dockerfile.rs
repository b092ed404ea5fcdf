use crate::image_config::BuildImageConfiguration;

/// Renders a Dockerfile for a build configuration that has no Dockerfile of its own.
pub fn render(build: &BuildImageConfiguration) -> String {
    // FROM scratch keeps a base-less configuration buildable
    let mut lines = vec![format!(
        "FROM {}",
        build.from.as_deref().unwrap_or("scratch")
    )];

    lines.extend(
        build
            .env
            .iter()
            .map(|(key, value)| format!("ENV {}={}", key, quote(value))),
    );
    lines.extend(
        build
            .labels
            .iter()
            .map(|(key, value)| format!("LABEL {}={}", key, quote(value))),
    );
    lines.extend(build.ports.iter().map(|port| format!("EXPOSE {}", port)));
    if let Some(assembly) = &build.assembly {
        let target = assembly.target_dir.trim_end_matches('/');
        lines.extend(
            assembly
                .sources
                .iter()
                .map(|source| format!("COPY {} {}/", source.display(), target)),
        );
    }
    if let Some(workdir) = &build.workdir {
        lines.push(format!("WORKDIR {}", workdir));
    }
    if let Some(entrypoint) = &build.entrypoint {
        lines.push(format!("ENTRYPOINT {}", exec_form(entrypoint)));
    }
    if let Some(cmd) = &build.cmd {
        lines.push(format!("CMD {}", exec_form(cmd)));
    }

    let mut out = lines.join("\n");
    out.push('\n');
    out
}

fn quote(value: &str) -> String {
    format!("\"{}\"", value.replace('\\', "\\\\").replace('"', "\\\""))
}

fn exec_form(args: &[String]) -> String {
    let quoted: Vec<String> = args.iter().map(|a| quote(a)).collect();
    format!("[{}]", quoted.join(","))
}
