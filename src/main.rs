#[rocket::launch]
fn rocket() -> _ {
    ngs_server::rocket()
}
