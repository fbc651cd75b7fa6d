//! Client shell: a thin REPL over the write/read pipelines.

use rustyline::error::ReadlineError;
use rustyline::Editor;

use crate::pipeline::{delete, download, upload, PeerContext};

const HELP: &str = "\
    help                view this message
    ls [-l]             list downloadable files (-l: show chunk placement)
    get <filename>       download a file
    put <path>           upload a file
    del <filename>       delete a file
    exit                 quit
";

/// Run the interactive shell against `ctx` until `exit` or EOF.
pub async fn run(ctx: &PeerContext) -> anyhow::Result<()> {
    println!("chunkmesh shell ready, type 'help' for commands.");
    let mut editor = Editor::<()>::new();

    loop {
        match editor.readline("$ ") {
            Ok(line) => {
                editor.add_history_entry(line.as_str());
                if let Err(err) = dispatch(ctx, &line).await {
                    println!("error: {:#}", err);
                }
            }
            Err(ReadlineError::Interrupted) | Err(ReadlineError::Eof) => break,
            Err(err) => {
                println!("readline error: {}", err);
                break;
            }
        }
    }
    Ok(())
}

async fn dispatch(ctx: &PeerContext, line: &str) -> anyhow::Result<()> {
    let mut tokens = line.split_whitespace();
    let command = match tokens.next() {
        Some(c) => c,
        None => return Ok(()),
    };
    let args: Vec<&str> = tokens.take(2).collect();

    match command {
        "help" => println!("{}", HELP),
        "exit" => std::process::exit(0),
        "get" => {
            let filename = args.first().ok_or_else(|| anyhow::anyhow!("usage: get <filename>"))?;
            download::get(ctx, filename).await?;
            println!("downloaded {} into download/{}", filename, filename);
        }
        "put" => {
            let path = args.first().ok_or_else(|| anyhow::anyhow!("usage: put <path>"))?;
            upload::put(ctx, std::path::Path::new(path)).await?;
            println!("uploaded {}", path);
        }
        "del" => {
            let filename = args.first().ok_or_else(|| anyhow::anyhow!("usage: del <filename>"))?;
            delete::del(ctx, filename).await?;
            println!("deleted {}", filename);
        }
        "ls" => list(ctx, args.first().copied()).await?,
        other => println!("unknown command: {} (try 'help')", other),
    }
    Ok(())
}

async fn list(ctx: &PeerContext, flag: Option<&str>) -> anyhow::Result<()> {
    ctx.lock.acquire_read().await;
    let result = if flag == Some("-l") {
        ctx.catalog.select_all_rows().map(|rows| {
            for row in rows {
                println!("{} {} {} {}", row.filename, row.index, row.key, row.peer);
            }
        })
    } else {
        ctx.catalog.select_distinct_filenames().map(|names| {
            for name in names {
                println!("{}", name);
            }
        })
    };
    ctx.lock.release_read().await;
    result
}
