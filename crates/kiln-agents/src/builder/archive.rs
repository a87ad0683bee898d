//! Build context files: script templates, credential rendering, and the tar
//! archives exchanged with the container.
//!
//! The build context tar lands at the container's filesystem root and
//! unpacks to `conan_build_package/`; the container leaves its results in
//! `conan_output/`, which comes back as a tar and is extracted into a
//! [`BuildOutput`].

use std::collections::HashMap;
use std::io::Read;

use dataplane::model::{ConanCredential, GitCredential, Platform};
use dataplane::output::BuildOutput;

use crate::scm::{build_credential_helper, decode_secret};

use super::BuildError;

pub const BUILD_PACKAGE_DIR_NAME: &str = "conan_build_package";
pub const BUILD_OUTPUT_DIR_NAME: &str = "conan_output";

const BUILD_SH: &str = r#"#!/bin/sh
set -e

export GIT_SSH_COMMAND="ssh -i ${build_package_dir}/id_rsa -o UserKnownHostsFile=${build_package_dir}/known_hosts"
git config --global credential.helper ${build_package_dir}/credential_helper.sh

mkdir -p ${build_output_dir}
mkdir -p /tmp/kiln_src
cd /tmp/kiln_src
git init .
git remote add origin "${git_url}"
git fetch origin ${git_sha}
git checkout --force ${git_sha}

conan config install ${conan_config_args}
${conan_credentials}

conan lock create ${path} ${lock_args} --lockfile-out ${build_output_dir}/lock.json
conan create ${path} ${create_reference} --profile ${conan_profile} ${conan_options} --json ${build_output_dir}/create.json
conan info ${path} --json ${build_output_dir}/info.json
"#;

const BUILD_PS1: &str = r#"$ErrorActionPreference = "Stop"

$env:GIT_SSH_COMMAND = "ssh -i ${escaped_build_package_dir}\id_rsa -o UserKnownHostsFile=${escaped_build_package_dir}\known_hosts"
git config --global credential.helper ${escaped_build_package_dir}\credential_helper.sh

New-Item -ItemType Directory -Force -Path "${build_output_dir}" | Out-Null
New-Item -ItemType Directory -Force -Path C:\kiln_src | Out-Null
Set-Location C:\kiln_src
git init .
git remote add origin "${git_url}"
git fetch origin ${git_sha}
git checkout --force ${git_sha}

conan config install ${conan_config_args}
${conan_credentials}

conan lock create ${path} ${lock_args} --lockfile-out ${build_output_dir}\lock.json
conan create ${path} ${create_reference} --profile ${conan_profile} ${conan_options} --json ${build_output_dir}\create.json
conan info ${path} --json ${build_output_dir}\info.json
"#;

/// Substitute `${name}` placeholders. Unknown placeholders are left as-is
/// so a template typo shows up verbatim in the container log.
pub fn substitute(template: &str, parameters: &HashMap<&'static str, String>) -> String {
    let mut rendered = String::with_capacity(template.len());
    let mut rest = template;
    while let Some(start) = rest.find("${") {
        rendered.push_str(&rest[..start]);
        let after = &rest[start + 2..];
        match after.find('}') {
            Some(end) => {
                let name = &after[..end];
                match parameters.get(name) {
                    Some(value) => rendered.push_str(value),
                    None => {
                        rendered.push_str("${");
                        rendered.push_str(name);
                        rendered.push('}');
                    }
                }
                rest = &after[end + 1..];
            }
            None => {
                rendered.push_str("${");
                rest = after;
            }
        }
    }
    rendered.push_str(rest);
    rendered
}

pub fn script_template(platform: Platform) -> &'static str {
    match platform {
        Platform::Linux => BUILD_SH,
        Platform::Windows => BUILD_PS1,
    }
}

pub fn script_name(platform: Platform) -> &'static str {
    match platform {
        Platform::Linux => "build.sh",
        Platform::Windows => "build.ps1",
    }
}

/// Render the `conan user` login lines for the container script.
///
/// Linux shells get `\`/`"` escaping and an `|| true` so a failed login
/// surfaces in the conan output rather than aborting the checkout;
/// PowerShell doubles embedded quotes.
pub fn render_conan_credentials(platform: Platform, credentials: &[ConanCredential]) -> String {
    credentials
        .iter()
        .map(|credential| match platform {
            Platform::Linux => format!(
                "conan user -r {} -p \"{}\" {} || true",
                credential.remote,
                credential.password.replace('\\', "\\\\").replace('"', "\\\""),
                credential.username
            ),
            Platform::Windows => format!(
                "conan user -r {} -p \"{}\" {}",
                credential.remote,
                credential.password.replace('"', "\"\""),
                credential.username
            ),
        })
        .collect::<Vec<_>>()
        .join("\n")
}

/// Pack the build context tar: the rendered script, the git credential
/// helper (mode 0555), and the decoded ssh key and known_hosts.
pub fn create_build_archive(
    platform: Platform,
    script: &str,
    git_credentials: &[GitCredential],
    ssh_key: &str,
    known_hosts: &str,
) -> Result<Vec<u8>, BuildError> {
    let ssh_key = decode_secret(ssh_key).map_err(|err| BuildError::failed(err.to_string()))?;
    let known_hosts =
        decode_secret(known_hosts).map_err(|err| BuildError::failed(err.to_string()))?;
    let helper = build_credential_helper(git_credentials);

    let mut builder = tar::Builder::new(Vec::new());
    append_entry(&mut builder, script_name(platform), script, 0o644)?;
    append_entry(&mut builder, "credential_helper.sh", &helper, 0o555)?;
    append_entry(&mut builder, "id_rsa", &ssh_key, 0o600)?;
    append_entry(&mut builder, "known_hosts", &known_hosts, 0o644)?;
    builder
        .into_inner()
        .map_err(|err| BuildError::failed(format!("failed to pack build archive: {err}")))
}

fn append_entry(
    builder: &mut tar::Builder<Vec<u8>>,
    name: &str,
    content: &str,
    mode: u32,
) -> Result<(), BuildError> {
    let mut header = tar::Header::new_gnu();
    header.set_size(content.len() as u64);
    header.set_mode(mode);
    header.set_cksum();
    builder
        .append_data(
            &mut header,
            format!("{BUILD_PACKAGE_DIR_NAME}/{name}"),
            content.as_bytes(),
        )
        .map_err(|err| BuildError::failed(format!("failed to pack {name}: {err}")))
}

/// Extract `create.json` / `info.json` / `lock.json` from the output tar.
/// Absent files stay `None`; the result manager deals with partial output.
pub fn extract_output_archive(data: &[u8]) -> Result<BuildOutput, BuildError> {
    let mut output = BuildOutput::default();
    let mut archive = tar::Archive::new(data);
    let entries = archive
        .entries()
        .map_err(|err| BuildError::failed(format!("failed to read output archive: {err}")))?;
    for entry in entries {
        let mut entry =
            entry.map_err(|err| BuildError::failed(format!("corrupt output archive: {err}")))?;
        let path = entry
            .path()
            .map_err(|err| BuildError::failed(format!("corrupt output archive: {err}")))?;
        let Some(name) = path.file_name().and_then(|name| name.to_str()) else {
            continue;
        };
        let slot = match name {
            "create.json" => &mut output.create,
            "info.json" => &mut output.info,
            "lock.json" => &mut output.lock,
            _ => continue,
        };
        let mut content = Vec::new();
        entry
            .read_to_end(&mut content)
            .map_err(|err| BuildError::failed(format!("failed to read output file: {err}")))?;
        *slot = Some(String::from_utf8_lossy(&content).into_owned());
    }
    Ok(output)
}

/// Build an output tar for tests and fakes.
pub fn pack_output_archive(output: &BuildOutput) -> Vec<u8> {
    let mut builder = tar::Builder::new(Vec::new());
    let files = [
        ("create.json", &output.create),
        ("info.json", &output.info),
        ("lock.json", &output.lock),
    ];
    for (name, content) in files {
        if let Some(content) = content {
            let mut header = tar::Header::new_gnu();
            header.set_size(content.len() as u64);
            header.set_mode(0o644);
            header.set_cksum();
            builder
                .append_data(
                    &mut header,
                    format!("{BUILD_OUTPUT_DIR_NAME}/{name}"),
                    content.as_bytes(),
                )
                .expect("write to in-memory tar");
        }
    }
    builder.into_inner().expect("finish in-memory tar")
}
