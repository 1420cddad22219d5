use std::path::PathBuf;

use log::info;
use structopt::StructOpt;

use base::defs::Result;

use crate::export_obj::export_obj;
use crate::import_obj::import_obj_file;
use crate::scene::load_views;
use crate::texture::{TextureParams, TexturedMesh};

#[derive(StructOpt)]
#[structopt(about = "Texture a mesh from calibrated views")]
pub struct TextureMeshCommand {
    #[structopt(help = "Input .obj mesh", long, short = "m")]
    mesh: PathBuf,

    #[structopt(help = "Scene .json file describing the views", long, short = "s")]
    scene: PathBuf,

    #[structopt(help = "Output .obj file", long, short = "o")]
    output: PathBuf,

    #[structopt(flatten)]
    params: TextureParams,
}

impl TextureMeshCommand {
    pub fn run(&self) -> Result<()> {
        let mesh = import_obj_file(&self.mesh)?;
        let views = load_views(&self.scene)?;
        info!("loaded {} views", views.len());
        let textured = TexturedMesh::new(&views, mesh, &self.params)?;
        export_obj(&textured, &self.output)
    }
}
