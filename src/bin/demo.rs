//! Demo embedder: serves a drawable canvas and lets viewers scribble on
//! it with the pointer.

use anyhow::Result;
use clap::Parser;
use log::info;

use fbcast::{InputEvent, Rect, Server};

#[derive(Parser, Debug)]
#[command(author, version, about = "Shared-canvas VNC server demo", long_about = None)]
struct Args {
    /// Address to listen on
    #[arg(short, long, default_value = "127.0.0.1:5900")]
    listen: String,

    /// Canvas width in pixels
    #[arg(long, default_value_t = 320)]
    width: u16,

    /// Canvas height in pixels
    #[arg(long, default_value_t = 240)]
    height: u16,
}

enum Event {
    Input(InputEvent),
    Cut(String),
    Closed,
}

#[tokio::main]
async fn main() -> Result<()> {
    env_logger::init();
    let args = Args::parse();

    let mut serv = Server::dumb(&args.listen, args.width, args.height).await?;
    info!("serving {}x{} canvas on {}", args.width, args.height, serv.local_addr());

    paint_test_pattern(&serv, args.width, args.height).await?;

    loop {
        let ev = tokio::select! {
            ev = serv.input.recv() => ev.map(Event::Input).unwrap_or(Event::Closed),
            txt = serv.cut.recv() => txt.map(Event::Cut).unwrap_or(Event::Closed),
        };
        match ev {
            Event::Input(InputEvent::Pointer { buttons, x, y }) => {
                if buttons & 1 != 0 {
                    draw_dot(&serv, x as i32, y as i32).await?;
                }
            }
            Event::Input(InputEvent::Key { down, keysym }) => {
                info!("key {:#06x} down={}", keysym, down);
            }
            Event::Cut(text) => {
                info!("cut text: {}", text);
            }
            Event::Closed => break,
        }
    }
    Ok(())
}

async fn paint_test_pattern(serv: &Server, w: u16, h: u16) -> Result<()> {
    let (w, h) = (w as i32, h as i32);
    let mut fb = serv.get_fb().await?;
    fb.fill(Rect::new(0, 0, w, h / 3), [220, 60, 60, 255]);
    fb.fill(Rect::new(0, h / 3, w, 2 * h / 3), [60, 220, 60, 255]);
    fb.fill(Rect::new(0, 2 * h / 3, w, h), [60, 60, 220, 255]);
    serv.release_fb(fb, vec![Rect::new(0, 0, w, h)]).await?;
    Ok(())
}

async fn draw_dot(serv: &Server, x: i32, y: i32) -> Result<()> {
    let dot = Rect::new(x - 1, y - 1, x + 2, y + 2);
    let mut fb = serv.get_fb().await?;
    fb.fill(dot, [50, 200, 150, 255]);
    serv.release_fb(fb, vec![dot]).await?;
    Ok(())
}
